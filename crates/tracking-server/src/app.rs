//! HTTP surface: router and shared state.

use crate::ws;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracking_hub::{ConnectionRegistry, HeartbeatConfig};

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub buffer_capacity: usize,
    pub heartbeat: HeartbeatConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/track/:delivery_id", get(ws::track_delivery))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "keys": state.registry.key_count(),
        "connections": state.registry.connection_count(),
    }))
}
