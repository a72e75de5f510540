//! Maps request URLs to resource kinds and pin status.

use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;
use url::Url;

use crate::config::Config;
use crate::pins::{NodeKey, PinRegistry};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "aac"];

/// What a request is asking for, which decides how it is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
  /// Top-level document (no file extension)
  Navigation,
  /// Listed in the static precache manifest
  Precached,
  ProjectImage,
  Animation,
  /// A node's `meta.json` or other project JSON
  ProjectMetadata,
  ProjectAudio,
  /// Not intercepted
  Unhandled,
}

impl ResourceKind {
  pub fn is_project_scoped(self) -> bool {
    matches!(
      self,
      Self::ProjectImage | Self::Animation | Self::ProjectMetadata | Self::ProjectAudio
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
  pub kind: ResourceKind,
  pub project_scoped: bool,
  pub pinned: bool,
}

/// Classifies request URLs against the precache manifest and the content layout.
#[derive(Debug, Clone)]
pub struct Classifier {
  precache: HashSet<String>,
  /// `/projects/`
  project_marker: String,
  /// `/assets/animations/`
  animation_marker: String,
  pins: Arc<PinRegistry>,
}

impl Classifier {
  pub fn new(config: &Config, pins: Arc<PinRegistry>) -> Result<Self> {
    let precache = config
      .precache_urls()?
      .into_iter()
      .map(String::from)
      .collect();

    Ok(Self {
      precache,
      project_marker: marker(&config.layout.project_root),
      animation_marker: marker(&config.layout.animation_root),
      pins,
    })
  }

  /// Classify a request URL.
  ///
  /// Checks run in priority order: navigation, precache manifest, then the
  /// project-scoped kinds by extension.
  pub fn classify(&self, url: &Url) -> Classification {
    let kind = self.kind(url);
    let pinned = kind.is_project_scoped() && self.is_pinned(url);
    Classification {
      kind,
      project_scoped: kind.is_project_scoped(),
      pinned,
    }
  }

  fn kind(&self, url: &Url) -> ResourceKind {
    let path = url.path();
    let extension = extension(path);

    let Some(extension) = extension else {
      return ResourceKind::Navigation;
    };
    if self.precache.contains(url.as_str()) {
      return ResourceKind::Precached;
    }

    let in_projects = path.contains(&self.project_marker);
    let is_json = extension == "json";

    if in_projects && IMAGE_EXTENSIONS.contains(&extension.as_str()) {
      ResourceKind::ProjectImage
    } else if is_json && path.contains(&self.animation_marker) {
      ResourceKind::Animation
    } else if in_projects && is_json {
      ResourceKind::ProjectMetadata
    } else if in_projects && AUDIO_EXTENSIONS.contains(&extension.as_str()) {
      ResourceKind::ProjectAudio
    } else {
      ResourceKind::Unhandled
    }
  }

  /// Whether the node owning this URL resolves as pinned.
  pub fn is_pinned(&self, url: &Url) -> bool {
    if self.pins.pin_all() {
      return true;
    }
    match self.node_key(url) {
      Some(key) => self.pins.is_pinned(&key),
      None => false,
    }
  }

  /// Key of the node that owns a project asset: the directory segments
  /// between the project root and the file name.
  pub fn node_key(&self, url: &Url) -> Option<NodeKey> {
    let path = url.path();
    let start = path.find(&self.project_marker)? + self.project_marker.len();
    let rest = &path[start..];
    let (dir, _file) = rest.rsplit_once('/')?;
    let segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    NodeKey::from_segments(&segments)
  }
}

fn marker(segment: &str) -> String {
  format!("/{}/", segment.trim_matches('/'))
}

/// Lowercased extension of the last path segment, if it has one.
fn extension(path: &str) -> Option<String> {
  let file = path.rsplit('/').next().unwrap_or(path);
  let (stem, ext) = file.rsplit_once('.')?;
  if stem.is_empty() && ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}
