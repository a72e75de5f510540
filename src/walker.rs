//! Prefetch of a pinned content subtree into the user partitions.
//!
//! A walk fetches a node's `meta.json`, then its cover, step images and audio
//! hints, and recurses into every child (hidden ones included). Siblings are
//! fetched concurrently; a per-walk semaphore caps how many requests are in
//! flight at once. A failed asset is logged and left out; it never aborts the
//! rest of the walk, and it is not retried.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join, join_all, BoxFuture, FutureExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CachedResponse, PartitionKind, Partitions};
use crate::config::Config;
use crate::origin::types::ProjectMeta;
use crate::origin::Origin;
use crate::pins::NodeKey;

/// Summary of one walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkReport {
  /// Nodes whose metadata was fetched
  pub nodes: usize,
  /// Entries written (metadata and assets)
  pub stored: usize,
  /// URLs that could not be fetched or stored
  pub failed: Vec<String>,
}

impl WalkReport {
  fn merge(&mut self, other: WalkReport) {
    self.nodes += other.nodes;
    self.stored += other.stored;
    self.failed.extend(other.failed);
  }
}

pub struct PrefetchWalker {
  origin: Arc<dyn Origin>,
  partitions: Partitions,
  base: Url,
  project_root: String,
  default_cover: String,
  max_in_flight: usize,
}

impl PrefetchWalker {
  pub fn new(config: &Config, origin: Arc<dyn Origin>, partitions: Partitions) -> Self {
    Self {
      origin,
      partitions,
      base: config.origin.clone(),
      project_root: config.layout.project_root.trim_matches('/').to_string(),
      default_cover: config.layout.default_cover.clone(),
      max_in_flight: config.walker.max_in_flight.max(1),
    }
  }

  /// Walk the subtree rooted at `root`, resolving once every node below it
  /// has been processed.
  pub async fn walk(&self, root: &NodeKey) -> WalkReport {
    let limit = Arc::new(Semaphore::new(self.max_in_flight));
    let report = self.walk_node(root.clone(), limit).await;

    if report.failed.is_empty() {
      info!(root = %root, nodes = report.nodes, stored = report.stored, "walk complete");
    } else {
      warn!(
        root = %root,
        nodes = report.nodes,
        stored = report.stored,
        failed = report.failed.len(),
        "walk complete with missing assets"
      );
    }
    report
  }

  fn walk_node(&self, key: NodeKey, limit: Arc<Semaphore>) -> BoxFuture<'_, WalkReport> {
    async move {
      let mut report = WalkReport::default();

      let meta_url = match self.asset_url(&key, "meta.json") {
        Ok(url) => url,
        Err(e) => {
          warn!(node = %key, error = %e, "invalid node path");
          return report;
        }
      };

      let meta = match self
        .fetch_into(&meta_url, PartitionKind::MetadataUser, &limit)
        .await
        .and_then(|response| parse_meta(&response))
      {
        Ok(meta) => meta,
        Err(e) => {
          warn!(node = %key, error = %e, "metadata unavailable, skipping subtree");
          report.failed.push(meta_url.to_string());
          return report;
        }
      };
      report.nodes += 1;
      report.stored += 1;
      debug!(
        node = %key,
        id = %meta.id,
        name = %meta.name,
        container = meta.is_container(),
        steps = meta.steps.len(),
        children = meta.children.len(),
        hidden = meta.children.iter().filter(|c| c.hidden).count(),
        "walking node"
      );

      let assets = self.node_assets(&meta);
      let fetches = assets.iter().map(|(file, kind)| {
        let key = &key;
        let limit = &limit;
        async move {
          let url = self.asset_url(key, file)?;
          self
            .fetch_into(&url, *kind, limit)
            .await
            .map(|_| ())
            .map_err(|e| eyre!("{}: {}", url, e))?;
          Ok::<_, color_eyre::Report>(())
        }
      });

      let children = meta.children.iter().filter_map(|child| match key.child(&child.path) {
        Some(child_key) => Some(self.walk_node(child_key, Arc::clone(&limit))),
        None => {
          warn!(
            node = %key,
            child = %child.name,
            id = %child.id,
            path = %child.path,
            "invalid child path"
          );
          None
        }
      });

      let (asset_results, child_reports) = join(join_all(fetches), join_all(children)).await;

      for result in asset_results {
        match result {
          Ok(()) => report.stored += 1,
          Err(e) => {
            warn!(node = %key, error = %e, "prefetch failed");
            report.failed.push(e.to_string());
          }
        }
      }
      for child in child_reports {
        report.merge(child);
      }

      report
    }
    .boxed()
  }

  /// Files a node owns, each with the partition it belongs in.
  fn node_assets<'a>(&'a self, meta: &'a ProjectMeta) -> Vec<(&'a str, PartitionKind)> {
    let mut assets: Vec<(&str, PartitionKind)> = Vec::new();
    let images = std::iter::once(meta.cover(&self.default_cover))
      .chain(meta.steps.iter().map(String::as_str));
    for file in images {
      if !assets.iter().any(|(f, _)| *f == file) {
        assets.push((file, PartitionKind::ImagesUser));
      }
    }
    for file in &meta.audio_steps {
      if !file.trim().is_empty() && !assets.iter().any(|(f, _)| f == file) {
        assets.push((file, PartitionKind::Audio));
      }
    }
    assets
  }

  fn asset_url(&self, key: &NodeKey, file: &str) -> Result<Url> {
    let path = format!("./{}/{}/{}", self.project_root, key, file.trim_start_matches('/'));
    self
      .base
      .join(&path)
      .map_err(|e| eyre!("Invalid asset path {}: {}", path, e))
  }

  /// Fetch one URL and store a successful response in `kind`.
  async fn fetch_into(
    &self,
    url: &Url,
    kind: PartitionKind,
    limit: &Semaphore,
  ) -> Result<CachedResponse> {
    let _permit = limit
      .acquire()
      .await
      .map_err(|e| eyre!("Prefetch limiter closed: {}", e))?;

    let response = self.origin.fetch(url).await?;
    if !response.is_success() {
      return Err(eyre!("HTTP {}", response.status));
    }

    self.partitions.get(kind).put(url.as_str(), &response)?;
    Ok(response)
  }
}

fn parse_meta(response: &CachedResponse) -> Result<ProjectMeta> {
  serde_json::from_slice(&response.body).map_err(|e| eyre!("Malformed meta.json: {}", e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{PartitionStore, SqliteStorage};
  use crate::testing::MockOrigin;
  use std::time::Duration;
  use tokio::sync::watch;

  const BASE: &str = "https://app.example/";

  fn setup(origin: MockOrigin, yaml: &str) -> (PrefetchWalker, Arc<MockOrigin>, Partitions) {
    let config = Config::from_yaml(&format!("origin: {}\nversion: v1\n{}", BASE, yaml)).unwrap();
    let store: Arc<dyn PartitionStore> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (_tx, rx) = watch::channel("v1".to_string());
    let partitions = Partitions::new(store, rx);
    let origin = Arc::new(origin);
    let walker = PrefetchWalker::new(
      &config,
      Arc::clone(&origin) as Arc<dyn Origin>,
      partitions.clone(),
    );
    (walker, origin, partitions)
  }

  fn url(path: &str) -> String {
    format!("{}{}", BASE, path)
  }

  fn key(raw: &str) -> NodeKey {
    NodeKey::parse(raw, "projects").unwrap()
  }

  fn serve_tree(origin: &MockOrigin) {
    origin.respond(
      &url("projects/a/meta.json"),
      200,
      br#"{"id":"a","name":"A","steps":[],"children":[
        {"id":"b","name":"B","path":"b"},
        {"id":"c","name":"C","path":"c","hidden":true}
      ]}"#,
    );
    origin.respond(&url("projects/a/cover.png"), 200, b"cover-a");
    origin.respond(
      &url("projects/a/b/meta.json"),
      200,
      br#"{"id":"b","name":"B","coverImage":"front.png","steps":["1.png","2.png"],"audioSteps":["audio/1.mp3",""]}"#,
    );
    origin.respond(&url("projects/a/b/front.png"), 200, b"front");
    origin.respond(&url("projects/a/b/1.png"), 200, b"one");
    origin.respond(&url("projects/a/b/2.png"), 200, b"two");
    origin.respond(&url("projects/a/b/audio/1.mp3"), 200, b"hint");
    origin.respond(
      &url("projects/a/c/meta.json"),
      200,
      br#"{"id":"c","name":"C","steps":["1.png"]}"#,
    );
    origin.respond(&url("projects/a/c/cover.png"), 200, b"cover-c");
    origin.respond(&url("projects/a/c/1.png"), 200, b"c-one");
  }

  #[tokio::test]
  async fn test_walk_populates_user_partitions_recursively() {
    let mock = MockOrigin::new();
    serve_tree(&mock);
    let (walker, _origin, partitions) = setup(mock, "");

    let report = walker.walk(&key("projects/a")).await;

    assert_eq!(report.nodes, 3);
    assert!(report.failed.is_empty(), "{:?}", report.failed);

    let meta = partitions.get(PartitionKind::MetadataUser);
    for path in ["projects/a/meta.json", "projects/a/b/meta.json", "projects/a/c/meta.json"] {
      assert!(meta.lookup(&url(path)).unwrap().is_some(), "{}", path);
    }

    let images = partitions.get(PartitionKind::ImagesUser);
    for path in [
      "projects/a/cover.png",
      "projects/a/b/front.png",
      "projects/a/b/1.png",
      "projects/a/b/2.png",
      "projects/a/c/cover.png",
      "projects/a/c/1.png",
    ] {
      assert!(images.lookup(&url(path)).unwrap().is_some(), "{}", path);
    }

    let audio = partitions.get(PartitionKind::Audio);
    assert!(audio
      .lookup(&url("projects/a/b/audio/1.mp3"))
      .unwrap()
      .is_some());

    // Nothing lands in the auto partitions
    assert!(partitions.get(PartitionKind::ImagesAuto).keys().unwrap().is_empty());
    assert!(partitions.get(PartitionKind::MetadataAuto).keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_asset_does_not_abort_siblings() {
    let mock = MockOrigin::new();
    serve_tree(&mock);
    mock.respond(&url("projects/a/b/1.png"), 500, b"boom");
    let (walker, _origin, partitions) = setup(mock, "");

    let report = walker.walk(&key("a")).await;

    assert_eq!(report.nodes, 3);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].contains("projects/a/b/1.png"));

    let images = partitions.get(PartitionKind::ImagesUser);
    assert!(images.lookup(&url("projects/a/b/1.png")).unwrap().is_none());
    assert!(images.lookup(&url("projects/a/b/2.png")).unwrap().is_some());
    assert!(images.lookup(&url("projects/a/c/1.png")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_missing_metadata_skips_subtree() {
    let mock = MockOrigin::new();
    serve_tree(&mock);
    mock.respond(&url("projects/a/b/meta.json"), 200, b"not json");
    let (walker, _origin, partitions) = setup(mock, "");

    let report = walker.walk(&key("a")).await;

    assert_eq!(report.nodes, 2);
    assert!(report.failed.iter().any(|u| u.ends_with("projects/a/b/meta.json")));
    assert!(partitions
      .get(PartitionKind::ImagesUser)
      .lookup(&url("projects/a/b/1.png"))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_missing_cover_is_tolerated() {
    let mock = MockOrigin::new();
    mock.respond(&url("projects/solo/meta.json"), 200, br#"{"steps":["1.png"]}"#);
    mock.respond(&url("projects/solo/1.png"), 200, b"one");
    let (walker, origin, _partitions) = setup(mock, "");

    let report = walker.walk(&key("solo")).await;

    assert_eq!(report.nodes, 1);
    assert_eq!(report.stored, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(origin.requests(&url("projects/solo/cover.png")), 1);
  }

  #[tokio::test]
  async fn test_offline_walk_stores_nothing() {
    let mock = MockOrigin::new();
    serve_tree(&mock);
    mock.set_online(false);
    let (walker, _origin, partitions) = setup(mock, "");

    let report = walker.walk(&key("a")).await;

    assert_eq!(report.nodes, 0);
    assert_eq!(report.failed.len(), 1);
    assert!(partitions.get(PartitionKind::MetadataUser).keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrency_is_capped() {
    let mock = MockOrigin::new().with_latency(Duration::from_millis(20));
    let steps: Vec<String> = (1..=12).map(|i| format!("\"{}.png\"", i)).collect();
    mock.respond(
      &url("projects/big/meta.json"),
      200,
      format!(r#"{{"steps":[{}]}}"#, steps.join(",")).as_bytes(),
    );
    for i in 1..=12 {
      mock.respond(&url(&format!("projects/big/{}.png", i)), 200, b"x");
    }
    mock.respond(&url("projects/big/cover.png"), 200, b"x");
    let (walker, origin, _partitions) = setup(mock, "walker:\n  max_in_flight: 3\n");

    let report = walker.walk(&key("big")).await;

    assert_eq!(report.stored, 14);
    assert!(origin.max_in_flight() <= 3, "saw {}", origin.max_in_flight());
    assert!(origin.max_in_flight() >= 2);
  }
}
