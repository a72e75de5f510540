//! Versioned cache bring-up.
//!
//! A run installs the configured version next to whatever version is active,
//! waits until the previous version can be retired, then activates: stale
//! partitions are deleted, the active version is swapped and connected
//! clients are told an update is ready.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{version_of, Partition, PartitionKind, PartitionStore, Partitions};
use crate::config::Config;
use crate::control::Notification;
use crate::origin::Origin;

/// How often a waiting version rechecks whether clients remain.
const CLIENT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  /// Installed and waiting for the previous version to be released
  Installed,
  Activating,
  Active,
  /// Install failed; the previous version keeps serving
  Failed,
}

pub struct Lifecycle {
  origin: Arc<dyn Origin>,
  store: Arc<dyn PartitionStore>,
  version: String,
  precache: Vec<Url>,
  active: watch::Sender<String>,
  state: watch::Sender<LifecycleState>,
  skip_waiting: Notify,
  notifications: broadcast::Sender<Notification>,
}

impl Lifecycle {
  /// Prepare a run for `config.version`.
  ///
  /// The newest other version found in the store stays active until this one
  /// is activated.
  pub fn new(
    config: &Config,
    origin: Arc<dyn Origin>,
    store: Arc<dyn PartitionStore>,
  ) -> Result<Self> {
    let previous = previous_version(store.as_ref(), &config.version)?;
    if let Some(previous) = &previous {
      info!(previous = %previous, version = %config.version, "found previous cache version");
    }

    let (active, _) = watch::channel(previous.unwrap_or_else(|| config.version.clone()));
    let (state, _) = watch::channel(LifecycleState::Installing);
    let (notifications, _) = broadcast::channel(16);

    Ok(Self {
      origin,
      store,
      version: config.version.clone(),
      precache: config.precache_urls()?,
      active,
      state,
      skip_waiting: Notify::new(),
      notifications,
    })
  }

  /// Partitions that follow the active version.
  pub fn partitions(&self) -> Partitions {
    Partitions::new(Arc::clone(&self.store), self.active.subscribe())
  }

  /// The version this run installs.
  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn active_version(&self) -> String {
    self.active.borrow().clone()
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
    self.state.subscribe()
  }

  /// Register a client. A waiting version is held back while any client is
  /// subscribed.
  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.notifications.subscribe()
  }

  pub fn client_count(&self) -> usize {
    self.notifications.receiver_count()
  }

  /// Stop waiting for clients and activate as soon as install completes.
  pub fn skip_waiting(&self) {
    info!(version = %self.version, "skip waiting requested");
    self.skip_waiting.notify_one();
  }

  /// Install, wait for handoff, activate.
  pub async fn run(&self) -> Result<()> {
    if let Err(e) = self.install().await {
      self.set_state(LifecycleState::Failed);
      return Err(e);
    }
    self.wait_for_handoff().await;
    self.activate()?;
    Ok(())
  }

  /// Open every partition of the new version and fill the static partition.
  ///
  /// Every precache URL must be fetched successfully before anything is
  /// written.
  pub async fn install(&self) -> Result<()> {
    self.set_state(LifecycleState::Installing);

    for kind in PartitionKind::ALL {
      self.store.open_partition(&kind.name(&self.version))?;
    }

    let fetches = self.precache.iter().map(|url| async move {
      let response = self.origin.fetch(url).await?;
      if !response.is_success() {
        return Err(eyre!("Precache of {} failed: HTTP {}", url, response.status));
      }
      Ok::<_, color_eyre::Report>((url, response))
    });
    let responses = try_join_all(fetches).await?;

    let partition = self.static_partition();
    for (url, response) in &responses {
      partition.put(url.as_str(), response)?;
    }

    info!(version = %self.version, entries = responses.len(), "installed");
    self.set_state(LifecycleState::Installed);
    Ok(())
  }

  /// Delete stale partitions, make this version active and notify clients.
  ///
  /// Returns the names of the deleted partitions.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.set_state(LifecycleState::Activating);

    let current: Vec<String> = PartitionKind::ALL
      .iter()
      .map(|kind| kind.name(&self.version))
      .collect();

    let mut deleted = Vec::new();
    for name in self.store.partition_names()? {
      if current.contains(&name) {
        continue;
      }
      if self.store.delete_partition(&name)? {
        debug!(partition = %name, "deleted stale partition");
        deleted.push(name);
      }
    }

    self.active.send_replace(self.version.clone());
    self.set_state(LifecycleState::Active);

    let clients = self
      .notifications
      .send(Notification::SwUpdateAvailable)
      .unwrap_or(0);
    info!(
      version = %self.version,
      deleted = deleted.len(),
      clients,
      "activated"
    );

    Ok(deleted)
  }

  async fn wait_for_handoff(&self) {
    if self.active_version() == self.version {
      return;
    }

    let mut poll = tokio::time::interval(CLIENT_POLL);
    loop {
      let clients = self.client_count();
      if clients == 0 {
        debug!(version = %self.version, "no clients remain on previous version");
        return;
      }

      tokio::select! {
        _ = self.skip_waiting.notified() => return,
        _ = poll.tick() => {}
      }
    }
  }

  fn static_partition(&self) -> Partition {
    Partition::new(
      Arc::clone(&self.store),
      PartitionKind::Static.name(&self.version),
    )
  }

  fn set_state(&self, state: LifecycleState) {
    let previous = self.state.send_replace(state);
    if previous != state {
      debug!(from = ?previous, to = ?state, "lifecycle transition");
    }
  }
}

/// Newest version other than `current` that still owns partitions.
fn previous_version(store: &dyn PartitionStore, current: &str) -> Result<Option<String>> {
  let names = store.partition_names()?;
  let previous = names
    .iter()
    .rev()
    .filter_map(|name| version_of(name))
    .find(|version| *version != current)
    .map(str::to_string);

  if previous.is_none() && names.iter().any(|name| version_of(name).is_none()) {
    warn!("ignoring partitions with unrecognised names");
  }
  Ok(previous)
}
