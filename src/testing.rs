//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::CachedResponse;
use crate::origin::{Origin, OriginRequest};

/// Scripted origin: per-URL responses, an online switch, and request counters.
///
/// Unknown URLs answer 404 while online.
pub struct MockOrigin {
  responses: Mutex<HashMap<String, CachedResponse>>,
  requests: Mutex<HashMap<String, usize>>,
  online: AtomicBool,
  latency: Duration,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

impl MockOrigin {
  pub fn new() -> Self {
    Self {
      responses: Mutex::new(HashMap::new()),
      requests: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      latency: Duration::ZERO,
      in_flight: AtomicUsize::new(0),
      max_in_flight: AtomicUsize::new(0),
    }
  }

  /// Delay every response, so concurrent requests overlap.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn respond(&self, url: &str, status: u16, body: &[u8]) {
    self.respond_with(url, CachedResponse::new(status, vec![], body.to_vec()));
  }

  pub fn respond_with(&self, url: &str, response: CachedResponse) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Number of requests seen for a URL.
  pub fn requests(&self, url: &str) -> usize {
    self.requests.lock().unwrap().get(url).copied().unwrap_or(0)
  }

  /// Highest number of requests that were in progress at once.
  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Origin for MockOrigin {
  async fn send(&self, request: OriginRequest) -> Result<CachedResponse> {
    let url = request.url.to_string();
    *self.requests.lock().unwrap().entry(url.clone()).or_default() += 1;

    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", url));
    }

    let response = self.responses.lock().unwrap().get(&url).cloned();
    Ok(response.unwrap_or_else(|| CachedResponse::synthetic(404, "Not found")))
  }
}
