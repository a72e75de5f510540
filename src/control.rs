//! Control channel: messages from the application, notifications back to it,
//! and the loop that turns pin requests into prefetch walks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::pins::{NodeKey, PinRegistry};
use crate::walker::{PrefetchWalker, WalkReport};

/// Control messages sent by the application
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate a waiting version without waiting for clients to leave
  SkipWaiting,
  PinProject {
    path: String,
  },
  UnpinProject {
    path: String,
  },
  PinAll {
    paths: Vec<String>,
  },
  /// Toggle the global pin flag; enabling also pins and walks `paths`
  SetOfflineAll {
    enabled: bool,
    #[serde(default)]
    paths: Vec<String>,
  },
}

/// Notifications pushed to connected clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
  SwUpdateAvailable,
}

/// Sending half of the control loop
#[derive(Clone)]
pub struct ControlHandle {
  tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlHandle {
  /// Queue a message. Returns false once the loop has stopped.
  pub fn send(&self, message: ControlMessage) -> bool {
    self.tx.send(message).is_ok()
  }
}

/// Applies control messages to the pin registry, the walker and the
/// lifecycle.
pub struct Controller {
  pins: Arc<PinRegistry>,
  walker: Arc<PrefetchWalker>,
  lifecycle: Arc<Lifecycle>,
  project_root: String,
}

impl Controller {
  pub fn new(
    pins: Arc<PinRegistry>,
    walker: Arc<PrefetchWalker>,
    lifecycle: Arc<Lifecycle>,
    project_root: &str,
  ) -> Self {
    Self {
      pins,
      walker,
      lifecycle,
      project_root: project_root.to_string(),
    }
  }

  /// Start the control loop and return its handle.
  ///
  /// The loop also watches the lifecycle: each time a version becomes
  /// active, every pinned subtree is walked again into the new partitions.
  /// The loop runs until every handle is dropped.
  pub fn spawn(self) -> ControlHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut state = self.lifecycle.watch_state();
    state.borrow_and_update();

    tokio::spawn(async move {
      loop {
        tokio::select! {
          message = rx.recv() => match message {
            Some(message) => {
              self.dispatch(message);
            }
            None => break,
          },
          Ok(()) = state.changed() => {
            if *state.borrow_and_update() == LifecycleState::Active {
              self.refresh_pins();
            }
          }
        }
      }
      debug!("control loop stopped");
    });

    ControlHandle { tx }
  }

  /// Apply one message. Walks run in the background; their handles are
  /// returned so callers can await them.
  pub fn dispatch(&self, message: ControlMessage) -> Vec<JoinHandle<WalkReport>> {
    debug!(?message, "control message");

    match message {
      ControlMessage::SkipWaiting => {
        self.lifecycle.skip_waiting();
        Vec::new()
      }
      ControlMessage::PinProject { path } => match self.key(&path) {
        Some(key) => {
          self.pins.pin(key.clone());
          info!(node = %key, "pinned");
          vec![self.spawn_walk(key)]
        }
        None => Vec::new(),
      },
      ControlMessage::UnpinProject { path } => {
        if let Some(key) = self.key(&path) {
          if self.pins.unpin(&key) {
            info!(node = %key, "unpinned");
          }
        }
        Vec::new()
      }
      ControlMessage::PinAll { paths } => paths
        .iter()
        .filter_map(|path| self.key(path))
        .map(|key| {
          self.pins.pin(key.clone());
          self.spawn_walk(key)
        })
        .collect(),
      ControlMessage::SetOfflineAll { enabled, paths } => {
        let seeds = paths.iter().filter_map(|path| self.key(path)).collect();
        let seeds = self.pins.set_pin_all(enabled, seeds);
        info!(enabled, seeds = seeds.len(), "offline-all");
        seeds.into_iter().map(|key| self.spawn_walk(key)).collect()
      }
    }
  }

  /// Walk every pinned subtree again.
  ///
  /// User partitions are version-named, so a new active version starts
  /// without the pinned content until it is fetched again.
  pub fn refresh_pins(&self) -> Vec<JoinHandle<WalkReport>> {
    let keys = self.pins.pinned_keys();
    if !keys.is_empty() {
      info!(
        version = %self.lifecycle.active_version(),
        pinned = keys.len(),
        "refreshing pinned content"
      );
    }
    keys.into_iter().map(|key| self.spawn_walk(key)).collect()
  }

  fn key(&self, path: &str) -> Option<NodeKey> {
    let key = NodeKey::parse(path, &self.project_root);
    if key.is_none() {
      warn!(path, "ignoring invalid node path");
    }
    key
  }

  fn spawn_walk(&self, key: NodeKey) -> JoinHandle<WalkReport> {
    let walker = Arc::clone(&self.walker);
    tokio::spawn(async move { walker.walk(&key).await })
  }
}
