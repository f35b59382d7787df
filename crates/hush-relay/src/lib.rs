#![forbid(unsafe_code)]

//! Hush Relay - blind fan-out of encrypted room traffic.
//!
//! The relay:
//! 1. Tracks which connection belongs to which room
//! 2. Forwards chat and signaling payloads to the other members of a room
//! 3. Never decrypts anything; payloads are opaque strings
//!
//! Nothing is persisted. Room state lives only as long as its members stay connected.

pub mod config;
pub mod hub;
pub mod rooms;
pub mod security;
pub mod signal;

use std::net::SocketAddr;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use config::{RelayConfig, TransportLimits};
pub use hub::{spawn_hub, HubEvent, RelayHandle, RelayHub, RelayStats};

#[derive(Clone)]
pub struct AppState {
    pub hub: RelayHandle,
    pub limits: TransportLimits,
}

#[derive(Serialize)]
struct RuntimeMetrics {
    active_connections: usize,
    active_rooms: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.hub.stats();
    (
        StatusCode::OK,
        Json(RuntimeMetrics {
            active_connections: stats.active_connections(),
            active_rooms: stats.active_rooms(),
        }),
    )
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.hub.stats();
    let prometheus_text = format!(
        r#"# HELP hush_relay_websocket_connections Active WebSocket connections
# TYPE hush_relay_websocket_connections gauge
hush_relay_websocket_connections {connections}
# HELP hush_relay_rooms Active rooms
# TYPE hush_relay_rooms gauge
hush_relay_rooms {rooms}
"#,
        connections = stats.active_connections(),
        rooms = stats.active_rooms(),
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prometheus_text,
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Hush Relay Online" }))
        .route("/health", get(health))
        .route("/metrics/runtime", get(health))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
