//! Relay's own HTTP routes, served only for the exact base domain.
//!
//! Requests for any other host never reach these handlers; they are proxied
//! by [`crate::tunnel::relay`].

pub mod health;
pub mod status;

use axum::{routing::get, Router};

use crate::state::RelayState;

/// Routes answered by the relay itself: health, tunnel listing, status page.
pub fn base_domain_router(state: RelayState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/tunnels", get(status::list_tunnels))
        .fallback(status::status_page)
        .with_state(state)
}
