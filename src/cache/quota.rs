//! Byte-budget enforcement for auto-populated partitions.
//!
//! Eviction is an LRU approximation: recency is the stored response's `date`
//! (or `last-modified`) header, i.e. last write, not last read. Entries without
//! a timestamp count as newest and go last. Passes are serialised, so two
//! passes scheduled back to back never evict on the same stale size.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Mutex;
use tracing::debug;

use super::partitions::Partition;

static PASS: Mutex<()> = Mutex::new(());

/// Outcome of one enforcement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eviction {
  /// Partition size before the pass
  pub before: u64,
  /// Partition size after the pass
  pub after: u64,
  /// Keys removed, oldest first
  pub removed: Vec<String>,
}

/// Evict oldest entries from `partition` until it holds at most `max_bytes`.
pub fn enforce(partition: &Partition, max_bytes: u64) -> Result<Eviction> {
  enforce_except(partition, max_bytes, |_| false)
}

/// Like [`enforce`], but never evicts keys for which `exempt` returns true.
///
/// Exempt entries still count toward the partition size, so a partition made
/// mostly of exempt entries can stay above budget.
pub fn enforce_except<F>(partition: &Partition, max_bytes: u64, exempt: F) -> Result<Eviction>
where
  F: Fn(&str) -> bool,
{
  // The lock guards no data, so poisoning is harmless
  let _pass = PASS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

  let before = partition.size()?;
  if before <= max_bytes {
    return Ok(Eviction {
      before,
      after: before,
      removed: Vec::new(),
    });
  }

  let mut candidates = partition.entry_stats(Utc::now())?;
  candidates.retain(|stat| !exempt(&stat.key));
  // Stable sort: equal timestamps keep enumeration order
  candidates.sort_by_key(|stat| stat.recency);

  let mut to_remove = before - max_bytes;
  let mut removed = Vec::new();
  let mut freed = 0u64;

  for stat in candidates {
    if to_remove == 0 {
      break;
    }
    // Counted even when another writer deleted the entry first
    to_remove = to_remove.saturating_sub(stat.size);
    if partition.delete(&stat.key)? {
      debug!(partition = partition.name(), key = %stat.key, size = stat.size, "evicted");
      freed += stat.size;
      removed.push(stat.key);
    }
  }

  Ok(Eviction {
    before,
    after: before - freed,
    removed,
  })
}
