//! Hypcast HTTP API.
//!
//! Routes served under `/api/`:
//! - `GET  /api/config/channels` — channel names in catalog order
//! - `POST /api/rpc/tune`, `POST /api/rpc/stop` — tuner control RPCs
//! - `GET  /api/socket/tuner-status` — status snapshot stream (WebSocket)
//! - `GET  /api/socket/webrtc-peer` — media signalling (WebSocket)
//!
//! RPC routes and WebSocket upgrades are all gated by the same-origin check.

pub mod csrf;
pub mod peer;
pub mod rpc;
pub mod status;

use crate::tuner::{Tuner, TunerError};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task;

/// Build the API router for a tuner.
pub fn router(tuner: Arc<Tuner>) -> Router {
    // Everything state-changing — including the socket upgrade GETs —
    // sits behind the same-origin gate.
    let guarded = Router::new()
        .route("/api/rpc/tune", post(rpc_tune))
        .route("/api/rpc/stop", post(rpc_stop))
        .route("/api/socket/tuner-status", get(socket_tuner_status))
        .route("/api/socket/webrtc-peer", get(socket_webrtc_peer))
        .route_layer(middleware::from_fn(csrf::require_same_origin));

    Router::new()
        .route("/api/config/channels", get(config_channels))
        .merge(guarded)
        .with_state(tuner)
}

async fn config_channels(State(tuner): State<Arc<Tuner>>) -> Json<Vec<String>> {
    Json(tuner.channel_names().map(str::to_owned).collect())
}

#[derive(Debug, Default, Deserialize)]
struct TuneParams {
    #[serde(rename = "ChannelName", default)]
    channel_name: String,
}

async fn rpc_tune(
    State(tuner): State<Arc<Tuner>>,
    rpc::RpcParams(params): rpc::RpcParams<TuneParams>,
) -> Result<StatusCode, rpc::RpcError> {
    if params.channel_name.is_empty() {
        return Err(rpc::RpcError::bad_request("channel name required"));
    }

    info!("Tuning to channel {}", params.channel_name);
    let result = task::spawn_blocking(move || tuner.tune(&params.channel_name))
        .await
        .map_err(|_| rpc::RpcError::internal("tuner unavailable"))?;

    match result {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        // Not 404; that would be ambiguous with a nonexistent RPC route.
        Err(err @ TunerError::ChannelNotFound(_)) => Err(rpc::RpcError::bad_request(err.to_string())),
    }
}

async fn rpc_stop(
    State(tuner): State<Arc<Tuner>>,
    rpc::RpcParams(_): rpc::RpcParams<StopParams>,
) -> Result<StatusCode, rpc::RpcError> {
    info!("Stopping tuner");
    task::spawn_blocking(move || tuner.stop())
        .await
        .map_err(|_| rpc::RpcError::internal("tuner unavailable"))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct StopParams {}

async fn socket_tuner_status(
    State(tuner): State<Arc<Tuner>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| status::handle_status_socket(socket, tuner))
}

async fn socket_webrtc_peer(State(tuner): State<Arc<Tuner>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| peer::handle_peer_socket(socket, tuner))
}
