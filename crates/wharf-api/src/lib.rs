//! Wharf Registry HTTP API
//!
//! This crate provides the Axum-based HTTP layer for Wharf,
//! implementing the v2 distribution API: blob pull/push with resumable
//! chunked uploads, manifest pull/push, tag listing, and the catalog.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle};
