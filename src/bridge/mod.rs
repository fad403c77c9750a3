// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! UI bridge server
//!
//! Exposes the download commands, the download event stream and the
//! backend helpers to the UI process over local HTTP.
//!
//! # Endpoints
//!
//! - `POST /downloads` - Request a download
//! - `POST /downloads/state` - Pause, resume or cancel
//! - `GET /downloads/state` - Query a download's state
//! - `GET /downloads/saved-path` - Where a live download is written
//! - `GET /downloads/events` - Server-sent download events
//! - `GET /server/heartbeat` - Probe the managed server
//! - `POST /api/:method` - Forward a call to the managed server
//! - `GET /health` - Health check
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use deskbridge::backend::BackendClient;
//! use deskbridge::bridge::{Bridge, BridgeState};
//! use deskbridge::config::Config;
//! use deskbridge::download::DownloadService;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::default();
//! let (events, _) = tokio::sync::broadcast::channel(256);
//! let (downloads, _worker) =
//!     DownloadService::spawn_http(reqwest::Client::new(), Arc::new(events.clone()));
//! let state = BridgeState {
//!     downloads,
//!     events,
//!     backend: BackendClient::from_config(&config.server)?,
//!     heartbeat: None,
//! };
//! Bridge::new(&config.bridge, state).start(std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::timeout::TimeoutLayer;

use crate::backend::BackendClient;
use crate::config::BridgeConfig;
use crate::download::{DownloadEvent, DownloadService, ReturnShape, StateCommand};
use crate::error::BridgeError;
use crate::supervisor::HeartbeatProbe;

/// Maximum request body size (1 MiB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Upper bound for producing a response. The event stream body is not
/// affected once its headers are sent.
const REQUEST_TIMEOUT_SECS: u64 = 180;

/// State shared across handlers.
pub struct BridgeState {
    pub downloads: DownloadService,
    /// Sender side of the download event fan-out; each SSE client subscribes.
    pub events: broadcast::Sender<DownloadEvent>,
    pub backend: BackendClient,
    /// Heartbeat wired to the supervisor. Without it the heartbeat route
    /// only probes.
    pub heartbeat: Option<Arc<HeartbeatProbe>>,
}

/// UI bridge listener.
pub struct Bridge {
    bind_address: String,
    port: u16,
    state: Arc<BridgeState>,
}

impl Bridge {
    pub fn new(config: &BridgeConfig, state: BridgeState) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.bind_address, self.port);
        tracing::info!("Starting bridge on {}", addr);

        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Bridge is binding to 0.0.0.0 which exposes download control to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Another deskbridge instance may be running; \
                    stop it or set bridge.port in deskbridge.json",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Router over an existing state.
pub fn router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/downloads", post(request_download_handler))
        .route(
            "/downloads/state",
            get(query_state_handler).post(set_state_handler),
        )
        .route("/downloads/saved-path", get(saved_path_handler))
        .route("/downloads/events", get(events_handler))
        .route("/server/heartbeat", get(heartbeat_handler))
        .route("/api/:method", post(api_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    url: String,
    destination_path: PathBuf,
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct SetStateRequest {
    fingerprint: String,
    url: String,
    command: StateCommand,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateQuery {
    fingerprint: String,
    url: String,
    #[serde(default)]
    return_type: ReturnShape,
}

#[derive(Debug, Deserialize)]
struct SavedPathQuery {
    fingerprint: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

fn error_response(e: &BridgeError) -> Response {
    let (status, error) = match e {
        BridgeError::Filesystem { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "filesystem"),
        BridgeError::ServiceClosed => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorBody {
            error,
            message: e.to_string(),
        }),
    )
        .into_response()
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn request_download_handler(
    State(state): State<Arc<BridgeState>>,
    Json(request): Json<DownloadRequest>,
) -> Response {
    match state
        .downloads
        .request_download(request.url, request.destination_path, request.fingerprint)
        .await
    {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// Always 204; stale targets are ignored by the manager.
async fn set_state_handler(
    State(state): State<Arc<BridgeState>>,
    Json(request): Json<SetStateRequest>,
) -> StatusCode {
    state
        .downloads
        .set_state(request.fingerprint, request.url, request.command)
        .await;
    StatusCode::NO_CONTENT
}

async fn query_state_handler(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<StateQuery>,
) -> Response {
    match state
        .downloads
        .query_state(query.fingerprint, query.url, query.return_type)
        .await
    {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn saved_path_handler(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<SavedPathQuery>,
) -> Response {
    match state.downloads.saved_path(query.fingerprint).await {
        Ok(path) => Json(path).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn events_handler(
    State(state): State<Arc<BridgeState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|item| match item {
        Ok(event) => match Event::default().event(event.kind()).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                tracing::warn!("cannot encode download event: {}", e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("event stream lagging: {}", e);
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn heartbeat_handler(State(state): State<Arc<BridgeState>>) -> Json<bool> {
    let ok = match &state.heartbeat {
        Some(probe) => probe.check().await,
        None => state.backend.heartbeat().await,
    };
    Json(ok)
}

async fn api_handler(
    State(state): State<Arc<BridgeState>>,
    Path(method): Path<String>,
    body: Option<Json<Value>>,
) -> Json<Value> {
    let args = match body {
        Some(Json(Value::Array(args))) => args,
        Some(Json(Value::Null)) | None => Vec::new(),
        Some(Json(single)) => vec![single],
    };
    Json(state.backend.call(&method, args).await)
}
