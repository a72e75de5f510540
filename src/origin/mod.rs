//! The network side of the proxy: the static content origin.

mod client;
pub mod types;

pub use client::HttpOrigin;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use reqwest::Method;
use url::Url;

use crate::cache::CachedResponse;

/// A request forwarded to the origin.
#[derive(Debug, Clone)]
pub struct OriginRequest {
  pub method: Method,
  pub url: Url,
  /// Request headers worth forwarding (already filtered)
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl OriginRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
      body: Bytes::new(),
    }
  }
}

/// Something that can answer requests over the network.
///
/// An `Err` means the origin could not be reached at all. Any HTTP status,
/// including server errors, comes back as `Ok`.
#[async_trait]
pub trait Origin: Send + Sync {
  async fn send(&self, request: OriginRequest) -> Result<CachedResponse>;

  /// Plain GET of a URL.
  async fn fetch(&self, url: &Url) -> Result<CachedResponse> {
    self.send(OriginRequest::get(url.clone())).await
  }
}

/// Headers that describe a single connection and must not be stored or
/// forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
  matches!(
    name.to_ascii_lowercase().as_str(),
    "connection"
      | "keep-alive"
      | "proxy-connection"
      | "transfer-encoding"
      | "te"
      | "trailer"
      | "upgrade"
      | "content-length"
      | "host"
  )
}
