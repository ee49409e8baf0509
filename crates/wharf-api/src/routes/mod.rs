//! API routes

mod health;
mod registry;

use axum::{Router, routing::get};
use std::sync::Arc;

use crate::state::{AppState, MetricsHandle};

/// Create the main router
pub fn create_router(state: AppState, metrics_handle: Option<Arc<MetricsHandle>>) -> Router {
    let mut router = Router::new()
        // Health check
        .merge(health::routes())
        // Distribution API (v2)
        .merge(registry::routes())
        .with_state(state);

    // The Prometheus endpoint only exists when a recorder was installed
    if let Some(handle) = metrics_handle {
        router = router.route("/metrics", get(move || async move { handle.render() }));
    }

    router
}
