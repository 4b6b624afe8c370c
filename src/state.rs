//! Shared relay state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::routes::status::StatusPage;
use crate::tunnel::registry::Registry;

/// Shared application state for the relay.
#[derive(Clone)]
pub struct RelayState {
    /// Live hostname → tunnel map.
    pub registry: Registry,
    /// Renders the base-domain status page.
    pub status_page: Arc<StatusPage>,
    /// Monotonic instant when the relay started (for uptime calculation).
    pub start_time: Instant,
}

impl RelayState {
    pub fn new(registry: Registry, status_page: StatusPage) -> Self {
        Self {
            registry,
            status_page: Arc::new(status_page),
            start_time: Instant::now(),
        }
    }
}
