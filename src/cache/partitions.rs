//! Named, versioned partitions over a [`PartitionStore`].

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;

use super::traits::{CachedResponse, EntryStat, PartitionStore};

/// The fixed set of partitions every cache version owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
  Static,
  ImagesAuto,
  ImagesUser,
  MetadataAuto,
  MetadataUser,
  Audio,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 6] = [
    Self::Static,
    Self::ImagesAuto,
    Self::ImagesUser,
    Self::MetadataAuto,
    Self::MetadataUser,
    Self::Audio,
  ];

  pub fn suffix(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::ImagesAuto => "images-auto",
      Self::ImagesUser => "images-user",
      Self::MetadataAuto => "metadata-auto",
      Self::MetadataUser => "metadata-user",
      Self::Audio => "audio",
    }
  }

  /// Partition name for this kind under a version tag, e.g. `v2-images-auto`.
  pub fn name(self, version: &str) -> String {
    format!("{}-{}", version, self.suffix())
  }

  /// Image partition for the given pin status.
  pub fn images(pinned: bool) -> Self {
    if pinned {
      Self::ImagesUser
    } else {
      Self::ImagesAuto
    }
  }

  /// Metadata partition for the given pin status.
  pub fn metadata(pinned: bool) -> Self {
    if pinned {
      Self::MetadataUser
    } else {
      Self::MetadataAuto
    }
  }
}

/// Version tag a partition name belongs to, if it is named like one of ours.
pub fn version_of(name: &str) -> Option<&str> {
  PartitionKind::ALL.iter().find_map(|kind| {
    name
      .strip_suffix(kind.suffix())
      .and_then(|rest| rest.strip_suffix('-'))
      .filter(|version| !version.is_empty())
  })
}

/// A single named partition.
#[derive(Clone)]
pub struct Partition {
  store: Arc<dyn PartitionStore>,
  name: String,
}

impl Partition {
  pub fn new(store: Arc<dyn PartitionStore>, name: String) -> Self {
    Self { store, name }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Look up the entry stored under `key`.
  pub fn lookup(&self, key: &str) -> Result<Option<CachedResponse>> {
    self.store.get(&self.name, key)
  }

  pub fn put(&self, key: &str, response: &CachedResponse) -> Result<()> {
    self.store.put(&self.name, key, response)
  }

  pub fn delete(&self, key: &str) -> Result<bool> {
    self.store.delete(&self.name, key)
  }

  pub fn keys(&self) -> Result<Vec<String>> {
    self.store.keys(&self.name)
  }

  pub fn size(&self) -> Result<u64> {
    self.store.size(&self.name)
  }

  pub fn entry_stats(&self, now: DateTime<Utc>) -> Result<Vec<EntryStat>> {
    self.store.entry_stats(&self.name, now)
  }
}

/// Resolves partition kinds to partitions of the currently active version.
#[derive(Clone)]
pub struct Partitions {
  store: Arc<dyn PartitionStore>,
  version: watch::Receiver<String>,
}

impl Partitions {
  pub fn new(store: Arc<dyn PartitionStore>, version: watch::Receiver<String>) -> Self {
    Self { store, version }
  }

  /// The version tag requests are currently served under.
  pub fn active_version(&self) -> String {
    self.version.borrow().clone()
  }

  /// Handle to a partition of the active version. Nothing is created until
  /// the first write.
  pub fn get(&self, kind: PartitionKind) -> Partition {
    self.for_version(kind, &self.active_version())
  }

  pub fn for_version(&self, kind: PartitionKind, version: &str) -> Partition {
    Partition::new(Arc::clone(&self.store), kind.name(version))
  }
}
