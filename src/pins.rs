//! Registry of content nodes pinned for offline use.
//!
//! Pinning a node covers everything reachable from it, but only the root key
//! is recorded here. Descendants resolve as pinned through their ancestor
//! prefix. The registry starts empty and lives as long as the proxy.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use url::Url;

/// Path key of a content node relative to the project root, e.g. `a/b`.
///
/// Keys are stored in the same percent-encoded form request URLs use, so a
/// key compares equal to the path segments of the assets it owns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey(String);

impl NodeKey {
  /// Normalise a raw node path.
  ///
  /// `a/b`, `/a/b/` and `projects/a/b` (with `project_root = "projects"`)
  /// all name the same node. Returns `None` for empty paths and paths with
  /// `.`/`..` segments or query/fragment characters.
  pub fn parse(raw: &str, project_root: &str) -> Option<Self> {
    let root = project_root.trim_matches('/');
    let mut path = raw.trim().trim_matches('/');
    if !root.is_empty() {
      if path == root {
        return None;
      }
      if let Some(rest) = path.strip_prefix(root).and_then(|r| r.strip_prefix('/')) {
        path = rest;
      }
    }
    Self::from_relative(path)
  }

  fn from_relative(path: &str) -> Option<Self> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty()
      || segments
        .iter()
        .any(|s| *s == "." || *s == ".." || s.contains(&['?', '#'][..]))
    {
      return None;
    }

    // Encode exactly the way URL joining will encode asset paths
    let base = Url::parse("http://node.invalid/").ok()?;
    let encoded = base.join(&format!("./{}", segments.join("/"))).ok()?;
    Some(Self(encoded.path().trim_matches('/').to_string()))
  }

  /// Build a key from path segments already taken from a request URL.
  pub fn from_segments(segments: &[&str]) -> Option<Self> {
    if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
      return None;
    }
    Some(Self(segments.join("/")))
  }

  /// Key of a child node whose `path` is relative to this one.
  pub fn child(&self, relative: &str) -> Option<Self> {
    let relative = relative.trim().trim_matches('/');
    Self::from_relative(&format!("{}/{}", self.0, relative))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// This key and every ancestor key, shortest first.
  pub fn ancestors(&self) -> impl Iterator<Item = &str> + '_ {
    self
      .0
      .match_indices('/')
      .map(|(idx, _)| &self.0[..idx])
      .chain(std::iter::once(self.0.as_str()))
  }
}

impl fmt::Display for NodeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Set of pinned node keys plus the global "pin everything" flag.
#[derive(Debug, Default)]
pub struct PinRegistry {
  pinned: RwLock<BTreeSet<NodeKey>>,
  pin_all: AtomicBool,
}

impl PinRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Pin a node. Returns false if it was already pinned.
  pub fn pin(&self, key: NodeKey) -> bool {
    self
      .pinned
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key)
  }

  /// Remove a pin. Stored entries are left alone.
  pub fn unpin(&self, key: &NodeKey) -> bool {
    self
      .pinned
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(key)
  }

  /// Set or clear the global flag.
  ///
  /// Enabling also pins every seed and returns the seeds to walk. Disabling
  /// clears the flag only; individual pins stay and nothing is returned.
  pub fn set_pin_all(&self, enabled: bool, seeds: Vec<NodeKey>) -> Vec<NodeKey> {
    self.pin_all.store(enabled, Ordering::SeqCst);
    if !enabled {
      return Vec::new();
    }
    for key in &seeds {
      self.pin(key.clone());
    }
    seeds
  }

  pub fn pin_all(&self) -> bool {
    self.pin_all.load(Ordering::SeqCst)
  }

  /// Whether a node resolves as pinned: the global flag is set, or the node
  /// or one of its ancestors is pinned.
  pub fn is_pinned(&self, key: &NodeKey) -> bool {
    if self.pin_all() {
      return true;
    }
    let pinned = self.pinned.read().unwrap_or_else(PoisonError::into_inner);
    key
      .ancestors()
      .any(|prefix| pinned.contains(&NodeKey(prefix.to_string())))
  }

  pub fn pinned_keys(&self) -> Vec<NodeKey> {
    self
      .pinned
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .cloned()
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(raw: &str) -> NodeKey {
    NodeKey::parse(raw, "projects").unwrap()
  }

  #[test]
  fn test_parse_normalises_forms() {
    assert_eq!(key("a/b").as_str(), "a/b");
    assert_eq!(key("/a/b/").as_str(), "a/b");
    assert_eq!(key("projects/a/b").as_str(), "a/b");
    assert_eq!(key("/projects/a//b").as_str(), "a/b");
    assert_eq!(key("projectsX/a").as_str(), "projectsX/a");
  }

  #[test]
  fn test_parse_rejects_bad_paths() {
    assert!(NodeKey::parse("", "projects").is_none());
    assert!(NodeKey::parse("projects", "projects").is_none());
    assert!(NodeKey::parse("a/../b", "projects").is_none());
    assert!(NodeKey::parse("a?x=1", "projects").is_none());
  }

  #[test]
  fn test_parse_encodes_like_urls() {
    assert_eq!(key("my project/step one").as_str(), "my%20project/step%20one");
  }

  #[test]
  fn test_child_composition() {
    assert_eq!(key("a").child("b").unwrap().as_str(), "a/b");
    assert_eq!(key("a/b").child("/c/").unwrap().as_str(), "a/b/c");
    assert!(key("a").child("..").is_none());
  }

  #[test]
  fn test_ancestors() {
    let k = key("a/b/c");
    assert_eq!(k.ancestors().collect::<Vec<_>>(), vec!["a", "a/b", "a/b/c"]);
  }

  #[test]
  fn test_pin_is_idempotent() {
    let registry = PinRegistry::new();
    assert!(registry.pin(key("a")));
    assert!(!registry.pin(key("a")));
    assert_eq!(registry.pinned_keys(), vec![key("a")]);
  }

  #[test]
  fn test_descendants_of_pinned_root_are_pinned() {
    let registry = PinRegistry::new();
    registry.pin(key("a"));

    assert!(registry.is_pinned(&key("a")));
    assert!(registry.is_pinned(&key("a/b/c")));
    assert!(!registry.is_pinned(&key("ab")));
    assert!(!registry.is_pinned(&key("b")));
  }

  #[test]
  fn test_unpin() {
    let registry = PinRegistry::new();
    registry.pin(key("a"));
    assert!(registry.unpin(&key("a")));
    assert!(!registry.unpin(&key("a")));
    assert!(!registry.is_pinned(&key("a/b")));
  }

  #[test]
  fn test_pin_all_seeds_and_clear_keeps_pins() {
    let registry = PinRegistry::new();
    let walk = registry.set_pin_all(true, vec![key("a"), key("b")]);

    assert_eq!(walk, vec![key("a"), key("b")]);
    assert!(registry.pin_all());
    assert!(registry.is_pinned(&key("unrelated")));

    let walk = registry.set_pin_all(false, vec![key("c")]);
    assert!(walk.is_empty());
    assert!(!registry.pin_all());
    assert!(!registry.is_pinned(&key("unrelated")));
    assert!(registry.is_pinned(&key("a/x")));
    assert!(!registry.is_pinned(&key("c")));
  }
}
