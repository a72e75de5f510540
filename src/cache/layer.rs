//! Serving strategies that combine partition lookups with network fetching.

use color_eyre::Result;
use std::future::Future;
use tracing::warn;

use super::partitions::Partition;
use super::traits::{CacheResult, CachedResponse};

/// Cache layer that runs a serving strategy against one partition.
///
/// Storage failures never fail a response: reads that error are treated as
/// misses and writes that error are logged and dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheLayer;

impl CacheLayer {
  pub fn new() -> Self {
    Self
  }

  /// Cache-first with refill.
  ///
  /// 1. Serve from the partition if present
  /// 2. Otherwise fetch from network and store a copy of successful responses
  /// 3. If the network fails, look once more (a concurrent request may have
  ///    filled the entry) and give up with the network error
  pub async fn cache_first<F, Fut>(
    &self,
    partition: &Partition,
    key: &str,
    fetcher: F,
  ) -> Result<CacheResult<CachedResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>>,
  {
    if let Some(cached) = self.lookup(partition, key) {
      return Ok(CacheResult::from_cache(cached));
    }

    match fetcher().await {
      Ok(response) => {
        if response.is_success() {
          self.store(partition, key, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.lookup(partition, key) {
        Some(cached) => Ok(CacheResult::offline(cached)),
        None => Err(e),
      },
    }
  }

  /// Network-first with cache fallback.
  ///
  /// 1. Always try the network; store successful responses
  /// 2. On network failure (or a server error), serve the cached copy
  /// 3. With nothing cached, a server error is returned as-is and a
  ///    transport failure is returned as the error
  pub async fn network_first<F, Fut>(
    &self,
    partition: &Partition,
    key: &str,
    fetcher: F,
  ) -> Result<CacheResult<CachedResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>>,
  {
    match fetcher().await {
      Ok(response) if response.is_success() => {
        self.store(partition, key, &response);
        Ok(CacheResult::from_network(response))
      }
      Ok(response) if response.is_server_error() => match self.lookup(partition, key) {
        Some(cached) => Ok(CacheResult::offline(cached)),
        None => Ok(CacheResult::from_network(response)),
      },
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(e) => {
        warn!(partition = partition.name(), key, error = %e, "network failed, trying cache");
        match self.lookup(partition, key) {
          Some(cached) => Ok(CacheResult::offline(cached)),
          None => Err(e),
        }
      }
    }
  }

  fn lookup(&self, partition: &Partition, key: &str) -> Option<CachedResponse> {
    match partition.lookup(key) {
      Ok(found) => found,
      Err(e) => {
        warn!(partition = partition.name(), key, error = %e, "cache read failed");
        None
      }
    }
  }

  fn store(&self, partition: &Partition, key: &str, response: &CachedResponse) {
    if let Err(e) = partition.put(key, response) {
      warn!(partition = partition.name(), key, error = %e, "cache write failed");
    }
  }
}
