//! HTTP and WebSocket handlers for the Chorus server.
//!
//! Upgrades are authenticated by the proxy in front of the server, which
//! forwards the user id in a header. The room comes from the `room_id` query
//! parameter. Once upgraded, the socket is handed to the hub's pumps.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chorus_core::{
    admit, validate_room_id, Hub, HubError, HubHandle, JsonlSink, MemoryPresence, PresenceCache,
    PumpConfig, RedisPresence,
};
use chorus_transport::AxumConnection;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the hub task.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    /// Pump settings derived from `config`.
    pub pump: PumpConfig,
}

impl AppState {
    /// Create new app state around a running hub.
    #[must_use]
    pub fn new(hub: HubHandle, config: Config) -> Self {
        let pump = config.pump_config();
        Self { hub, config, pump }
    }
}

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing or empty {0} header")]
    Unauthenticated(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Server is shutting down")]
    Unavailable,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::InvalidRoom(reason) => Self::BadRequest(reason.to_string()),
            _ => Self::Unavailable,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Connect the presence cache, falling back to memory when Redis is not
/// configured or unreachable.
async fn connect_presence(config: &Config) -> Arc<dyn PresenceCache> {
    let presence = config.presence_config();

    if let Some(url) = &config.presence.redis_url {
        match RedisPresence::connect(url, presence.clone()).await {
            Ok(redis) => return Arc::new(redis),
            Err(e) => warn!(
                "failed to connect to redis, proceeding without redis: {}",
                e
            ),
        }
    }

    info!("Using in-memory presence cache");
    Arc::new(MemoryPresence::new(presence.ttl))
}

/// Start the hub and build the shared state.
///
/// # Errors
///
/// Returns an error if the persistence directory cannot be opened.
pub async fn build_state(config: Config) -> Result<(Arc<AppState>, JoinHandle<()>)> {
    let presence = connect_presence(&config).await;

    let directory = config.persist_directory();
    let sink = JsonlSink::open(&directory)
        .await
        .with_context(|| format!("Failed to open message store at {}", directory.display()))?;

    let (hub, task) = Hub::spawn(config.hub_config(), presence, Arc::new(sink));
    Ok((Arc::new(AppState::new(hub, config)), task))
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/rooms/:room_id", get(room_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let (state, hub_task) = build_state(config).await?;
    let hub = state.hub.clone();
    let path = state.config.transport.websocket_path.clone();

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Chorus server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}?room_id=<room>", addr, path);

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(hub))
    .await
    .context("Server error")?;

    if let Err(e) = hub_task.await {
        error!("Hub task failed: {}", e);
    }
    info!("Chorus server stopped");
    Ok(())
}

/// Wait for Ctrl-C, then stop the hub so open sockets are closed.
async fn shutdown_signal(hub: HubHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
    hub.shutdown();
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.hub.is_closed() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Hub statistics.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.hub.stats().await?))
}

/// Members of one room.
async fn room_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.hub.snapshot(room_id.as_str()).await? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(ApiError::NotFound(format!("Room {room_id} has no members"))),
    }
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    room_id: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<RoomQuery>,
) -> Result<Response, ApiError> {
    let header = state.config.transport.user_header.as_str();
    let Some(user_id) = headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
    else {
        metrics::record_rejection("unauthenticated");
        return Err(ApiError::Unauthenticated(header.to_owned()));
    };

    let room_id = query.room_id.unwrap_or_default();
    if let Err(reason) = validate_room_id(&room_id) {
        metrics::record_rejection("invalid_room");
        return Err(ApiError::BadRequest(reason.to_owned()));
    }

    if state.hub.is_closed() {
        metrics::record_rejection("shutting_down");
        return Err(ApiError::Unavailable);
    }

    debug!(user = %user_id, room = %room_id, remote = %remote, "Upgrading connection");
    Ok(ws
        .max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, user_id, room_id, remote)))
}

/// Handle an upgraded WebSocket until both pumps exit.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: String,
    room_id: String,
    remote: SocketAddr,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = AxumConnection::new(socket).with_remote_addr(remote);
    match admit(&state.hub, Box::new(connection), user_id, room_id, &state.pump).await {
        Ok(pump) => {
            let id = pump.id().clone();
            let final_state = pump.closed().await;
            debug!(connection = %id, state = ?final_state, "WebSocket disconnected");
        }
        Err(e) => debug!(remote = %remote, "Admission failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status() {
        assert_eq!(
            ApiError::Unauthenticated("x-user-id".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(HubError::InvalidRoom("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(HubError::Closed).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
