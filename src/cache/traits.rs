//! Core traits and types for the partitioned response cache.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::Result;

/// A response in the shape the cache stores it.
///
/// Network responses are converted into this shape as soon as they arrive so
/// that a single type flows from the origin, through the partitions, and out
/// to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  /// Header pairs with lowercase names, in origin order.
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl CachedResponse {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
    let headers = headers
      .into_iter()
      .map(|(name, value)| (name.to_ascii_lowercase(), value))
      .collect();
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  /// A plain-text response generated by the proxy itself.
  pub fn synthetic(status: u16, message: &str) -> Self {
    Self::new(
      status,
      vec![(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
      )],
      Bytes::copy_from_slice(message.as_bytes()),
    )
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_server_error(&self) -> bool {
    (500..600).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn size(&self) -> u64 {
    self.body.len() as u64
  }

  /// Recency timestamp used for eviction ordering.
  ///
  /// Taken from the `date` header, then `last-modified`. Responses without a
  /// parseable timestamp report `now`, so they sort as the newest entries.
  pub fn recency(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    recency_from_headers(&self.headers, now)
  }
}

pub(crate) fn recency_from_headers(
  headers: &[(String, String)],
  now: DateTime<Utc>,
) -> DateTime<Utc> {
  ["date", "last-modified"]
    .iter()
    .find_map(|name| {
      headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| DateTime::parse_from_rfc2822(v).ok())
    })
    .map(|dt| dt.with_timezone(&Utc))
    .unwrap_or(now)
}

/// Size and recency of one partition entry, as seen by the quota enforcer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStat {
  pub key: String,
  pub size: u64,
  pub recency: DateTime<Utc>,
}

/// Trait for partition storage backends.
///
/// A backend owns a set of named partitions, each a key -> response map keyed
/// by canonical request URL. Writing into a partition that does not exist yet
/// creates it.
pub trait PartitionStore: Send + Sync {
  /// Create the partition if it does not exist.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// Names of all existing partitions, oldest first.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and all its entries. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Look up an entry.
  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Insert or overwrite an entry.
  fn put(&self, partition: &str, key: &str, response: &CachedResponse) -> Result<()>;

  /// Remove an entry. Returns whether it existed.
  fn delete(&self, partition: &str, key: &str) -> Result<bool>;

  /// Entry keys in enumeration (insertion) order.
  fn keys(&self, partition: &str) -> Result<Vec<String>>;

  /// Total body bytes held by the partition.
  fn size(&self, partition: &str) -> Result<u64> {
    Ok(self.entry_stats(partition, Utc::now())?.iter().map(|s| s.size).sum())
  }

  /// Size and recency of each entry, in enumeration order.
  fn entry_stats(&self, partition: &str, now: DateTime<Utc>) -> Result<Vec<EntryStat>> {
    let mut stats = Vec::new();
    for key in self.keys(partition)? {
      if let Some(response) = self.get(partition, &key)? {
        stats.push(EntryStat {
          size: response.size(),
          recency: response.recency(now),
          key,
        });
      }
    }
    Ok(stats)
  }
}

/// Result from a serving strategy, including the response and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  /// Cached data served because the network attempt failed.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }

  pub fn synthetic(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthetic,
    }
  }

  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from the origin
  Network,
  /// Served from a partition without touching the network
  Cache,
  /// Network unavailable, serving a cached copy
  Offline,
  /// Generated by the proxy because nothing else could answer
  Synthetic,
  /// Not intercepted
  Passthrough,
}

impl CacheSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Synthetic => "synthetic",
      Self::Passthrough => "passthrough",
    }
  }
}
