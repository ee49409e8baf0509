//! Application state

use std::sync::Arc;
use wharf_core::{BlobStore, ManifestService, Namespace, UploadManager};

/// Type alias for the Prometheus metrics handle
pub type MetricsHandle = metrics_exporter_prometheus::PrometheusHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub blobs: Arc<BlobStore>,
    pub uploads: Arc<UploadManager>,
    pub manifests: Arc<ManifestService>,
    pub namespace: Arc<Namespace>,
    /// Refuse all mutations (maintenance windows)
    pub read_only: bool,
    /// Registry-as-cache deployments likewise refuse mutations
    pub mirror_mode: bool,
    /// Blob and manifest deletion is opt-in
    pub delete_enabled: bool,
}

impl AppState {
    pub fn new(
        blobs: Arc<BlobStore>,
        uploads: Arc<UploadManager>,
        manifests: Arc<ManifestService>,
        namespace: Arc<Namespace>,
        read_only: bool,
        mirror_mode: bool,
        delete_enabled: bool,
    ) -> Self {
        Self {
            blobs,
            uploads,
            manifests,
            namespace,
            read_only,
            mirror_mode,
            delete_enabled,
        }
    }
}
