//! Health check endpoints

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use wharf_core::digest::{Algorithm, digest_of};

use crate::state::AppState;

/// Health status response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub storage: &'static str,
    pub version: &'static str,
}

/// Liveness plus storage readiness.
///
/// The readiness probe stats a well-known digest against the blob
/// store: the blob is never expected to exist, but the lookup exercises
/// the storage driver end to end without touching any data.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    metrics::counter!("wharf_health_checks_total").increment(1);

    let probe = digest_of(Algorithm::Sha256, b"");
    let storage_ok = state.blobs.stat(&probe).await.is_ok();

    let (code, status, storage) = if storage_ok {
        (StatusCode::OK, "healthy", "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded", "unreachable")
    };

    (
        code,
        Json(HealthResponse {
            status,
            storage,
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Create health routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
}
