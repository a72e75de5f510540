//! Serde model of the per-node `meta.json` documents.

use serde::Deserialize;

/// A node's `meta.json`.
///
/// Parsing is permissive: every field except the ones the walker needs may be
/// missing, and missing lists read as empty.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectMeta {
  pub id: String,
  pub name: String,
  pub cover_image: Option<String>,
  /// Step image filenames, in order
  pub steps: Vec<String>,
  /// Audio-hint filenames, index-aligned with `steps`
  pub audio_steps: Vec<String>,
  pub children: Vec<ChildRef>,
}

impl ProjectMeta {
  /// A node without steps only lists children.
  pub fn is_container(&self) -> bool {
    self.steps.is_empty()
  }

  /// Cover filename, or `default` when none is named.
  pub fn cover<'a>(&'a self, default: &'a str) -> &'a str {
    self
      .cover_image
      .as_deref()
      .filter(|c| !c.trim().is_empty())
      .unwrap_or(default)
  }
}

/// Reference to a child node.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChildRef {
  pub id: String,
  pub name: String,
  /// Path relative to the parent node
  pub path: String,
  pub hidden: bool,
}
