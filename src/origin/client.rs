//! HTTP origin backed by one shared `reqwest` client.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use super::{is_hop_by_hop, Origin, OriginRequest};
use crate::cache::CachedResponse;

/// Origin client backed by a shared `reqwest` connection pool.
#[derive(Clone)]
pub struct HttpOrigin {
  client: reqwest::Client,
}

impl HttpOrigin {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("stepcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Origin for HttpOrigin {
  async fn send(&self, request: OriginRequest) -> Result<CachedResponse> {
    let OriginRequest {
      method,
      url,
      headers,
      body,
    } = request;

    let mut builder = self.client.request(method.clone(), url.clone());
    for (name, value) in headers.iter().filter(|(name, _)| !is_hop_by_hop(name)) {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if !body.is_empty() {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?;

    debug!(%method, %url, status, bytes = body.len(), "origin response");

    Ok(CachedResponse::new(status, headers, body))
  }
}
