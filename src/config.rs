//! Configuration: a YAML file found through a search order, with defaults
//! for every field and validation before use.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the static content tree
  pub origin: Url,
  pub listen: SocketAddr,
  /// Cache version tag embedded in every partition name
  pub version: String,
  pub storage: StorageConfig,
  /// Static precache manifest, relative to `origin`
  pub precache: Vec<String>,
  /// Animation assets, precached together with the manifest
  pub animations: Vec<String>,
  pub layout: LayoutConfig,
  pub quota: QuotaConfig,
  pub walker: WalkerConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://127.0.0.1:8080/").expect("static URL is valid"),
      listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
      version: "dev".to_string(),
      storage: StorageConfig::default(),
      precache: [
        "./",
        "./index.html",
        "./manifest.json",
        "./assets/css/main.css",
        "./assets/js/main.js",
        "./assets/js/router.js",
        "./assets/js/data-loader.js",
        "./assets/js/state.js",
        "./assets/js/view-project-grid.js",
        "./assets/js/view-viewer.js",
        "./assets/js/audio-feedback.js",
        "./assets/js/qr-code.js",
        "./assets/js/onboarding.js",
        "./assets/js/favorites.js",
        "./assets/js/pwa-install.js",
        "./assets/js/visibility.js",
        "./assets/js/version.js",
        "./assets/js/celebration/index.js",
        "./assets/js/celebration/emoji.js",
        "./assets/js/celebration/lottie.js",
        "./assets/js/celebration/sound.js",
        "./assets/js/lottie.min.js",
        "./assets/icons/icon-192.png",
        "./assets/icons/icon-512.png",
      ]
      .map(String::from)
      .to_vec(),
      animations: [
        "confetti", "emoji", "stars", "stars2", "stars3", "celebrate",
      ]
      .map(|name| format!("./assets/animations/{}.json", name))
      .to_vec(),
      layout: LayoutConfig::default(),
      quota: QuotaConfig::default(),
      walker: WalkerConfig::default(),
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite database file; `:memory:` keeps everything in RAM
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
  /// Path segment under which project content lives
  pub project_root: String,
  pub animation_root: String,
  /// Document served when a navigation request cannot reach the network
  pub index: String,
  /// Cover filename used when a node's metadata names none
  pub default_cover: String,
}

impl Default for LayoutConfig {
  fn default() -> Self {
    Self {
      project_root: "projects".to_string(),
      animation_root: "assets/animations".to_string(),
      index: "./index.html".to_string(),
      default_cover: "cover.png".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
  pub images_bytes: u64,
  pub audio_bytes: u64,
}

impl Default for QuotaConfig {
  fn default() -> Self {
    Self {
      images_bytes: 50 * 1024 * 1024,
      audio_bytes: 20 * 1024 * 1024,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
  /// Concurrent prefetch requests allowed per walk
  pub max_in_flight: usize,
}

impl Default for WalkerConfig {
  fn default() -> Self {
    Self { max_in_flight: 6 }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Also write logs to a daily rolling file in this directory
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stepcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stepcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found. The version tag
  /// can be overridden with `STEPCACHE_VERSION`.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Some(version) = Self::version_override() {
      config.version = version;
    }
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stepcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stepcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Version tag from `STEPCACHE_VERSION`, if set and non-empty.
  fn version_override() -> Option<String> {
    std::env::var("STEPCACHE_VERSION")
      .ok()
      .map(|v| v.trim().to_string())
      .filter(|v| !v.is_empty())
  }

  pub fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("Cache version tag must not be empty"));
    }
    if self.layout.project_root.trim_matches('/').is_empty() {
      return Err(eyre!("layout.project_root must not be empty"));
    }
    if self.walker.max_in_flight == 0 {
      return Err(eyre!("walker.max_in_flight must be at least 1"));
    }
    Ok(())
  }

  /// Absolute URLs of everything installed into the static partition.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    self
      .precache
      .iter()
      .chain(&self.animations)
      .map(|path| self.resolve(path))
      .collect()
  }

  pub fn index_url(&self) -> Result<Url> {
    self.resolve(&self.layout.index)
  }

  fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {} relative to {}: {}", path, self.origin, e))
  }
}
