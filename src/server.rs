//! HTTP surface: the control endpoint, the client event stream, a status
//! snapshot, and the proxy fallback for everything else.

use axum::{
  body::{Body, Bytes},
  extract::{Request, State},
  http::{header, StatusCode},
  response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse, Response,
  },
  routing::{get, post},
  Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::cache::{CacheResult, CachedResponse, PartitionKind, Partitions};
use crate::control::{ControlHandle, ControlMessage};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::origin::OriginRequest;
use crate::pins::PinRegistry;
use crate::proxy::CachingProxy;

/// Largest request body forwarded to the origin.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

pub const SOURCE_HEADER: &str = "x-stepcache-source";

#[derive(Clone)]
pub struct AppState {
  pub proxy: CachingProxy,
  pub partitions: Partitions,
  pub control: ControlHandle,
  pub lifecycle: Arc<Lifecycle>,
  pub pins: Arc<PinRegistry>,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/__stepcache/control", post(control))
    .route("/__stepcache/events", get(events))
    .route("/__stepcache/status", get(status))
    .fallback(proxy)
    .with_state(state)
}

async fn control(State(state): State<AppState>, body: Bytes) -> Response {
  let message: ControlMessage = match serde_json::from_slice(&body) {
    Ok(message) => message,
    Err(e) => {
      warn!(error = %e, "rejected control message");
      return (StatusCode::BAD_REQUEST, format!("Invalid control message: {}", e)).into_response();
    }
  };

  if state.control.send(message) {
    StatusCode::ACCEPTED.into_response()
  } else {
    (StatusCode::SERVICE_UNAVAILABLE, "Control loop stopped").into_response()
  }
}

/// Server-sent events; each subscriber counts as a client of the active
/// version until it disconnects.
async fn events(State(state): State<AppState>) -> impl IntoResponse {
  let mut rx = state.lifecycle.subscribe();
  debug!(clients = state.lifecycle.client_count(), "client connected");

  let stream = async_stream::stream! {
    loop {
      match rx.recv().await {
        Ok(notification) => yield Event::default().json_data(&notification),
        Err(RecvError::Lagged(skipped)) => {
          warn!(skipped, "client fell behind on notifications");
        }
        Err(RecvError::Closed) => break,
      }
    }
  };

  Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
  state: LifecycleState,
  version: String,
  active_version: String,
  clients: usize,
  pin_all: bool,
  pinned: Vec<String>,
  partitions: Vec<PartitionUsage>,
}

#[derive(Debug, Serialize)]
struct PartitionUsage {
  name: String,
  entries: usize,
  bytes: u64,
}

fn partition_usage(partitions: &Partitions) -> Vec<PartitionUsage> {
  PartitionKind::ALL
    .iter()
    .filter_map(|kind| {
      let partition = partitions.get(*kind);
      let usage = partition.keys().and_then(|keys| {
        Ok(PartitionUsage {
          name: partition.name().to_string(),
          entries: keys.len(),
          bytes: partition.size()?,
        })
      });
      usage
        .map_err(|e| warn!(partition = partition.name(), error = %e, "cache read failed"))
        .ok()
    })
    .collect()
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
  Json(StatusSnapshot {
    state: state.lifecycle.state(),
    version: state.lifecycle.version().to_string(),
    active_version: state.lifecycle.active_version(),
    clients: state.lifecycle.client_count(),
    pin_all: state.pins.pin_all(),
    pinned: state
      .pins
      .pinned_keys()
      .iter()
      .map(|key| key.to_string())
      .collect(),
    partitions: partition_usage(&state.partitions),
  })
}

async fn proxy(State(state): State<AppState>, request: Request) -> Response {
  let (parts, body) = request.into_parts();

  let path_and_query = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let url = match state.proxy.origin_url(path_and_query) {
    Ok(url) => url,
    Err(e) => {
      debug!(path = path_and_query, error = %e, "unroutable request");
      return (StatusCode::BAD_REQUEST, "Invalid request path").into_response();
    }
  };

  let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
    Ok(body) => body,
    Err(e) => {
      warn!(%url, error = %e, "failed to read request body");
      return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
    }
  };

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| *name != header::HOST)
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let result = state
    .proxy
    .handle(OriginRequest {
      method: parts.method,
      url,
      headers,
      body,
    })
    .await;

  to_response(result)
}

fn to_response(result: CacheResult<CachedResponse>) -> Response {
  let CacheResult { data, source } = result;

  let mut builder = axum::http::Response::builder().status(data.status);
  for (name, value) in &data.headers {
    if name == header::CONTENT_LENGTH.as_str() {
      continue;
    }
    builder = builder.header(name.as_str(), value.as_str());
  }

  builder
    .header(SOURCE_HEADER, source.as_str())
    .body(Body::from(data.body))
    .unwrap_or_else(|e| {
      warn!(error = %e, "unrepresentable response");
      (StatusCode::BAD_GATEWAY, "Unrepresentable origin response").into_response()
    })
}
