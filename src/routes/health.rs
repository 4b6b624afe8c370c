//! Relay health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::RelayState;

/// `GET /api/health` on the base domain — liveness probe.
pub async fn health(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "domain": state.registry.domain(),
        "tunnels": state.registry.len().await,
    }))
}
