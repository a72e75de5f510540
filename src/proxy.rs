//! Request interception: classify each request and serve it with the
//! strategy for its kind.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  quota, CacheLayer, CacheResult, CacheSource, CachedResponse, Partition, PartitionKind,
  Partitions,
};
use crate::classify::{Classification, Classifier, ResourceKind};
use crate::config::{Config, QuotaConfig};
use crate::origin::{Origin, OriginRequest};

/// The caching proxy's request path.
///
/// Every GET is classified and served from the partitions, the network or a
/// blend of both. Nothing that happens here ever fails the request: errors
/// turn into cached fallbacks or synthetic responses.
#[derive(Clone)]
pub struct CachingProxy {
  origin: Arc<dyn Origin>,
  partitions: Partitions,
  classifier: Classifier,
  cache: CacheLayer,
  base: Url,
  index_url: Url,
  quota: QuotaConfig,
}

impl CachingProxy {
  pub fn new(
    config: &Config,
    origin: Arc<dyn Origin>,
    partitions: Partitions,
    classifier: Classifier,
  ) -> Result<Self> {
    Ok(Self {
      origin,
      partitions,
      classifier,
      cache: CacheLayer::new(),
      base: config.origin.clone(),
      index_url: config.index_url()?,
      quota: config.quota.clone(),
    })
  }

  /// Canonical origin URL for an incoming path and query.
  ///
  /// The path is always resolved as a relative reference under the origin
  /// directory. Anything that would land on another scheme, host or port,
  /// or above that directory, is rejected.
  pub fn origin_url(&self, path_and_query: &str) -> Result<Url> {
    let relative = format!("./{}", path_and_query.trim_start_matches('/'));
    let root = self.base.join("./")?;
    let url = root
      .join(&relative)
      .map_err(|e| eyre!("Invalid request path {}: {}", path_and_query, e))?;

    if url.scheme() != root.scheme()
      || url.host_str() != root.host_str()
      || url.port_or_known_default() != root.port_or_known_default()
      || !url.path().starts_with(root.path())
    {
      return Err(eyre!("Request path {} escapes origin {}", path_and_query, root));
    }
    Ok(url)
  }

  /// Serve one request.
  pub async fn handle(&self, request: OriginRequest) -> CacheResult<CachedResponse> {
    if request.method != Method::GET {
      return self.passthrough(request).await;
    }

    let classification = self.classifier.classify(&request.url);
    debug!(
      url = %request.url,
      kind = ?classification.kind,
      scoped = classification.project_scoped,
      pinned = classification.pinned,
      "classified"
    );

    match classification.kind {
      ResourceKind::Navigation => self.navigation(request).await,
      ResourceKind::Precached | ResourceKind::Animation => {
        self.static_asset(&request.url).await
      }
      ResourceKind::ProjectImage | ResourceKind::ProjectAudio => {
        self.project_asset(&request.url, classification).await
      }
      ResourceKind::ProjectMetadata => self.metadata(&request.url, classification.pinned).await,
      ResourceKind::Unhandled => self.passthrough(request).await,
    }
  }

  /// Network-first; offline, fall back to the cached index document.
  async fn navigation(&self, request: OriginRequest) -> CacheResult<CachedResponse> {
    let url = request.url.clone();
    match self.origin.send(request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        warn!(%url, error = %e, "navigation offline, serving index");
        let fallback = self
          .partitions
          .get(PartitionKind::Static)
          .lookup(self.index_url.as_str());
        match fallback {
          Ok(Some(index)) => CacheResult::offline(index),
          Ok(None) => CacheResult::synthetic(CachedResponse::synthetic(503, "Offline")),
          Err(e) => {
            warn!(error = %e, "cache read failed");
            CacheResult::synthetic(CachedResponse::synthetic(503, "Offline"))
          }
        }
      }
    }
  }

  /// Cache-first against the static partition.
  async fn static_asset(&self, url: &Url) -> CacheResult<CachedResponse> {
    let partition = self.partitions.get(PartitionKind::Static);
    match self
      .cache
      .cache_first(&partition, url.as_str(), || self.origin.fetch(url))
      .await
    {
      Ok(result) => result,
      Err(e) => {
        warn!(%url, error = %e, "static asset unavailable");
        CacheResult::synthetic(CachedResponse::synthetic(503, "Resource not available"))
      }
    }
  }

  /// Cache-first against the auto or user partition, with eviction after
  /// filling an auto partition.
  async fn project_asset(
    &self,
    url: &Url,
    classification: Classification,
  ) -> CacheResult<CachedResponse> {
    let is_image = classification.kind == ResourceKind::ProjectImage;
    let kind = if is_image {
      PartitionKind::images(classification.pinned)
    } else {
      PartitionKind::Audio
    };
    let partition = self.partitions.get(kind);

    match self
      .cache
      .cache_first(&partition, url.as_str(), || self.origin.fetch(url))
      .await
    {
      Ok(result) => {
        let filled = result.source == CacheSource::Network && result.data.is_success();
        if filled && !classification.pinned {
          self.schedule_quota(partition, is_image);
        }
        result
      }
      Err(e) => {
        warn!(%url, error = %e, "project asset unavailable");
        if is_image {
          if let Some(cached) = self.sibling_lookup(kind, url) {
            return CacheResult::offline(cached);
          }
          CacheResult::synthetic(CachedResponse::synthetic(404, "Image not available"))
        } else {
          CacheResult::synthetic(CachedResponse::synthetic(404, "Audio not available"))
        }
      }
    }
  }

  /// Network-first against the auto or user metadata partition.
  async fn metadata(&self, url: &Url, pinned: bool) -> CacheResult<CachedResponse> {
    let kind = PartitionKind::metadata(pinned);
    let partition = self.partitions.get(kind);

    match self
      .cache
      .network_first(&partition, url.as_str(), || self.origin.fetch(url))
      .await
    {
      Ok(result) => result,
      Err(_) => match self.sibling_lookup(kind, url) {
        Some(cached) => CacheResult::offline(cached),
        None => CacheResult::synthetic(CachedResponse::synthetic(503, "Metadata not available")),
      },
    }
  }

  async fn passthrough(&self, request: OriginRequest) -> CacheResult<CachedResponse> {
    let url = request.url.clone();
    match self.origin.send(request).await {
      Ok(response) => CacheResult::passthrough(response),
      Err(e) => {
        warn!(%url, error = %e, "origin unreachable");
        CacheResult::synthetic(CachedResponse::synthetic(502, "Origin unreachable"))
      }
    }
  }

  /// Look in the other tier of a split partition (auto vs user). Used only
  /// after the network has failed, so an unpinned node can still be served
  /// from what pinning stored, and vice versa.
  fn sibling_lookup(&self, kind: PartitionKind, url: &Url) -> Option<CachedResponse> {
    let sibling = match kind {
      PartitionKind::ImagesAuto => PartitionKind::ImagesUser,
      PartitionKind::ImagesUser => PartitionKind::ImagesAuto,
      PartitionKind::MetadataAuto => PartitionKind::MetadataUser,
      PartitionKind::MetadataUser => PartitionKind::MetadataAuto,
      _ => return None,
    };
    self
      .partitions
      .get(sibling)
      .lookup(url.as_str())
      .unwrap_or_else(|e| {
        warn!(error = %e, "cache read failed");
        None
      })
  }

  /// Run quota enforcement in the background.
  ///
  /// The audio partition holds pinned and unpinned files alike, so its pass
  /// skips every URL that currently resolves as pinned.
  fn schedule_quota(&self, partition: Partition, is_image: bool) {
    let classifier = self.classifier.clone();
    let max_bytes = if is_image {
      self.quota.images_bytes
    } else {
      self.quota.audio_bytes
    };

    tokio::task::spawn_blocking(move || {
      let result = if is_image {
        quota::enforce(&partition, max_bytes)
      } else {
        quota::enforce_except(&partition, max_bytes, |key| {
          Url::parse(key)
            .map(|url| classifier.is_pinned(&url))
            .unwrap_or(false)
        })
      };
      match result {
        Ok(eviction) if !eviction.removed.is_empty() => info!(
          partition = partition.name(),
          removed = eviction.removed.len(),
          before = eviction.before,
          after = eviction.after,
          "quota enforced"
        ),
        Ok(_) => {}
        Err(e) => warn!(partition = partition.name(), error = %e, "quota enforcement failed"),
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{PartitionStore, SqliteStorage};
  use crate::pins::{NodeKey, PinRegistry};
  use crate::testing::MockOrigin;
  use std::time::Duration;
  use tokio::sync::watch;

  const BASE: &str = "https://app.example/";

  struct Fixture {
    proxy: CachingProxy,
    origin: Arc<MockOrigin>,
    pins: Arc<PinRegistry>,
    partitions: Partitions,
  }

  fn fixture(yaml: &str) -> Fixture {
    let config = Config::from_yaml(&format!("origin: {}\nversion: v1\n{}", BASE, yaml)).unwrap();
    let store: Arc<dyn PartitionStore> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (_tx, rx) = watch::channel(config.version.clone());
    let partitions = Partitions::new(store, rx);
    let pins = Arc::new(PinRegistry::new());
    let classifier = Classifier::new(&config, Arc::clone(&pins)).unwrap();
    let origin = Arc::new(MockOrigin::new());
    let proxy = CachingProxy::new(
      &config,
      Arc::clone(&origin) as Arc<dyn Origin>,
      partitions.clone(),
      classifier,
    )
    .unwrap();
    Fixture {
      proxy,
      origin,
      pins,
      partitions,
    }
  }

  fn get(path: &str) -> OriginRequest {
    OriginRequest::get(Url::parse(BASE).unwrap().join(path).unwrap())
  }

  fn url(path: &str) -> String {
    Url::parse(BASE).unwrap().join(path).unwrap().to_string()
  }

  #[tokio::test]
  async fn test_cache_first_kinds_are_idempotent() {
    let f = fixture("precache: ['./index.html']\n");
    for path in ["/index.html", "/projects/a/1.png", "/projects/a/1.mp3", "/assets/animations/x.json"] {
      f.origin.respond(&url(path), 200, path.as_bytes());
    }

    for path in ["/index.html", "/projects/a/1.png", "/projects/a/1.mp3", "/assets/animations/x.json"] {
      let first = f.proxy.handle(get(path)).await;
      f.origin.respond(&url(path), 200, b"changed upstream");
      let second = f.proxy.handle(get(path)).await;

      assert_eq!(first.source, CacheSource::Network, "{}", path);
      assert_eq!(second.source, CacheSource::Cache, "{}", path);
      assert_eq!(first.data, second.data, "{}", path);
    }
  }

  #[tokio::test]
  async fn test_metadata_is_network_first_with_fallback() {
    let f = fixture("");
    let meta = url("/projects/a/meta.json");
    f.origin.respond(&meta, 200, br#"{"steps":["1.png"]}"#);

    let first = f.proxy.handle(get("/projects/a/meta.json")).await;
    assert_eq!(first.source, CacheSource::Network);

    f.origin.respond(&meta, 200, br#"{"steps":["1.png","2.png"]}"#);
    let second = f.proxy.handle(get("/projects/a/meta.json")).await;
    assert_eq!(second.source, CacheSource::Network);
    assert_eq!(&second.data.body[..], br#"{"steps":["1.png","2.png"]}"#);

    f.origin.set_online(false);
    let offline = f.proxy.handle(get("/projects/a/meta.json")).await;
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data.body, second.data.body);
    assert_eq!(f.origin.requests(&meta), 3);
  }

  #[tokio::test]
  async fn test_metadata_unavailable_is_synthetic_503() {
    let f = fixture("");
    f.origin.set_online(false);
    let result = f.proxy.handle(get("/projects/a/meta.json")).await;
    assert_eq!(result.source, CacheSource::Synthetic);
    assert_eq!(result.data.status, 503);
  }

  #[tokio::test]
  async fn test_missing_image_offline_is_synthetic_404() {
    let f = fixture("");
    f.origin.set_online(false);

    let image = f.proxy.handle(get("/projects/a/9.png")).await;
    assert_eq!(image.source, CacheSource::Synthetic);
    assert_eq!(image.data.status, 404);

    let audio = f.proxy.handle(get("/projects/a/9.mp3")).await;
    assert_eq!(audio.data.status, 404);
  }

  #[tokio::test]
  async fn test_pinned_assets_go_to_user_partition() {
    let f = fixture("");
    f.pins.pin(NodeKey::parse("a", "projects").unwrap());
    f.origin.respond(&url("/projects/a/b/1.png"), 200, b"img");
    f.origin.respond(&url("/projects/c/1.png"), 200, b"img");

    f.proxy.handle(get("/projects/a/b/1.png")).await;
    f.proxy.handle(get("/projects/c/1.png")).await;

    let user = f.partitions.get(PartitionKind::ImagesUser).keys().unwrap();
    let auto = f.partitions.get(PartitionKind::ImagesAuto).keys().unwrap();
    assert_eq!(user, vec![url("/projects/a/b/1.png")]);
    assert_eq!(auto, vec![url("/projects/c/1.png")]);
  }

  #[tokio::test]
  async fn test_auto_fill_triggers_eviction() {
    let f = fixture("quota:\n  images_bytes: 10\n");
    f.origin.respond_with(
      &url("/projects/a/1.png"),
      CachedResponse::new(200, vec![("date".into(), "01 Jan 2024 00:00:00 GMT".into())], vec![0u8; 8]),
    );
    f.origin.respond_with(
      &url("/projects/a/2.png"),
      CachedResponse::new(200, vec![("date".into(), "02 Jan 2024 00:00:00 GMT".into())], vec![0u8; 8]),
    );

    let user = f.partitions.get(PartitionKind::ImagesUser);
    user
      .put(&url("/projects/a/1.png"), &CachedResponse::new(200, vec![], vec![0u8; 8]))
      .unwrap();

    f.proxy.handle(get("/projects/a/1.png")).await;
    f.proxy.handle(get("/projects/a/2.png")).await;

    let auto = f.partitions.get(PartitionKind::ImagesAuto);
    let evicted = tokio::time::timeout(Duration::from_secs(5), async {
      loop {
        if auto.keys().unwrap() == vec![url("/projects/a/2.png")] {
          break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await;
    assert!(evicted.is_ok(), "oldest image was not evicted");
    assert!(user.lookup(&url("/projects/a/1.png")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_unpinned_image_falls_back_to_user_tier_offline() {
    let f = fixture("");
    let image = url("/projects/a/1.png");
    f.partitions
      .get(PartitionKind::ImagesUser)
      .put(&image, &CachedResponse::new(200, vec![], "pinned copy"))
      .unwrap();
    f.origin.set_online(false);

    let result = f.proxy.handle(get("/projects/a/1.png")).await;
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(&result.data.body[..], b"pinned copy");
  }

  #[tokio::test]
  async fn test_navigation_falls_back_to_index() {
    let f = fixture("precache: ['./index.html']\n");
    f.origin.respond(&url("/index.html"), 200, b"<html>");
    f.proxy.handle(get("/index.html")).await;

    f.origin.respond(&url("/some/route"), 200, b"live");
    let online = f.proxy.handle(get("/some/route")).await;
    assert_eq!(online.source, CacheSource::Network);
    // Navigation responses are not cached
    assert!(f
      .partitions
      .get(PartitionKind::Static)
      .lookup(&url("/some/route"))
      .unwrap()
      .is_none());

    f.origin.set_online(false);
    let offline = f.proxy.handle(get("/some/route")).await;
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(&offline.data.body[..], b"<html>");
  }

  #[tokio::test]
  async fn test_unhandled_and_non_get_pass_through() {
    let f = fixture("");
    f.origin.respond(&url("/projects.json"), 200, b"[]");

    let result = f.proxy.handle(get("/projects.json")).await;
    assert_eq!(result.source, CacheSource::Passthrough);

    let mut post = get("/projects/a/1.png");
    post.method = Method::POST;
    f.origin.respond(&url("/projects/a/1.png"), 200, b"posted");
    let result = f.proxy.handle(post).await;
    assert_eq!(result.source, CacheSource::Passthrough);
    assert!(f
      .partitions
      .get(PartitionKind::ImagesAuto)
      .keys()
      .unwrap()
      .is_empty());

    f.origin.set_online(false);
    let result = f.proxy.handle(get("/projects.json")).await;
    assert_eq!(result.data.status, 502);
  }

  #[test]
  fn test_origin_url_keeps_base_path() {
    let f = fixture("");
    assert_eq!(
      f.proxy.origin_url("/projects/a/1.png?v=2").unwrap().as_str(),
      "https://app.example/projects/a/1.png?v=2"
    );
  }

  #[test]
  fn test_origin_url_stays_on_origin() {
    let f = fixture("");
    for path in [
      "/http:evil.example/steal",
      "/ftp://evil.example/x",
      "//evil.example/x",
      "/a:b",
      "/../x",
    ] {
      let url = f.proxy.origin_url(path).unwrap();
      assert_eq!(url.scheme(), "https", "{}", path);
      assert_eq!(url.host_str(), Some("app.example"), "{}", path);
    }
    assert_eq!(
      f.proxy.origin_url("/http:evil.example/steal").unwrap().as_str(),
      "https://app.example/http:evil.example/steal"
    );
  }

  #[test]
  fn test_origin_url_rejects_paths_above_base() {
    let config = Config::from_yaml("origin: https://app.example/app/\nversion: v1\n").unwrap();
    let store: Arc<dyn PartitionStore> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (_tx, rx) = watch::channel(config.version.clone());
    let pins = Arc::new(PinRegistry::new());
    let proxy = CachingProxy::new(
      &config,
      Arc::new(MockOrigin::new()),
      Partitions::new(store, rx),
      Classifier::new(&config, pins).unwrap(),
    )
    .unwrap();

    assert_eq!(
      proxy.origin_url("/index.html").unwrap().as_str(),
      "https://app.example/app/index.html"
    );
    assert!(proxy.origin_url("/../admin").is_err());
    assert!(proxy.origin_url("/%2e%2e/admin").is_err());
  }
}
