//! Partitioned response cache.
//!
//! This module provides the storage side of the proxy:
//! - Named, versioned partitions over a pluggable [`PartitionStore`]
//! - A SQLite-backed store
//! - Cache-first and network-first serving strategies
//! - Byte-budget eviction for auto-populated partitions

mod layer;
mod partitions;
pub mod quota;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use partitions::{version_of, Partition, PartitionKind, Partitions};
pub use storage::SqliteStorage;
pub use traits::{CacheResult, CacheSource, CachedResponse, PartitionStore};
