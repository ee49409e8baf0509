//! Wharf - a content-addressed container image registry

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::Config;
use wharf_api::{AppState, MetricsHandle, create_router};
use wharf_core::{BlobStore, ManifestService, Namespace, UploadManager, spawn_expiry_sweeper};
use wharf_storage::{LocalDriver, MemoryDriver, S3Config, S3Driver, StorageDriver};

/// Wharf - a content-addressed container image registry
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/wharf.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "WHARF_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "WHARF_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args.config)?;

    // Initialize logging
    init_logging(&config.logging.level);

    info!("Starting Wharf v{}", env!("CARGO_PKG_VERSION"));

    if config.server.secret == config::default_secret() {
        tracing::warn!(
            "Upload tokens are signed with the default secret; set [server] secret in production"
        );
    }

    // Initialize storage driver
    let driver: Arc<dyn StorageDriver> = match config.storage.backend.as_str() {
        "s3" => {
            let s3_config = S3Config {
                bucket: config
                    .storage
                    .s3
                    .bucket
                    .clone()
                    .unwrap_or_else(|| "wharf".to_string()),
                region: config
                    .storage
                    .s3
                    .region
                    .clone()
                    .unwrap_or_else(|| "us-east-1".to_string()),
                endpoint: config.storage.s3.endpoint.clone(),
                access_key_id: config.storage.s3.access_key.clone(),
                secret_access_key: config.storage.s3.secret_key.clone(),
                prefix: config.storage.s3.prefix.clone(),
                allow_http: config.storage.s3.allow_http,
            };
            info!("Using S3 storage driver: bucket={}", s3_config.bucket);
            Arc::new(S3Driver::new(s3_config).await?)
        }
        "memory" => {
            info!("Using in-memory storage driver (contents are lost on restart)");
            Arc::new(MemoryDriver::new())
        }
        _ => {
            info!(
                "Using local storage driver: path={}",
                config.storage.local.path
            );
            Arc::new(LocalDriver::new(&config.storage.local.path).await?)
        }
    };

    // Core services
    let blobs = Arc::new(BlobStore::new(driver.clone(), !config.storage.trusted));
    let uploads = Arc::new(UploadManager::new(
        driver.clone(),
        blobs.clone(),
        config.server.secret.as_bytes().to_vec(),
        config.uploads.session_ttl_hours,
    ));
    let manifests = Arc::new(ManifestService::new(driver.clone(), blobs.clone()));
    let namespace = Arc::new(Namespace::new(driver));

    // Spawn the background upload expiry sweeper
    let _sweeper = spawn_expiry_sweeper(
        uploads.clone(),
        config.uploads.sweep_interval_hours * 3600,
    );

    // Create application state
    let state = AppState::new(
        blobs,
        uploads,
        manifests,
        namespace,
        config.server.read_only,
        config.server.mirror_mode,
        config.deletes.enabled,
    );

    // Initialize Prometheus metrics
    let metrics_handle = init_metrics();

    // Create router
    let app = create_router(state, metrics_handle.map(Arc::new))
        .layer(TraceLayer::new_for_http());

    // Determine bind address
    let bind_addr = args.bind.unwrap_or(config.server.bind_address);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind_addr, port).parse()?;

    info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Initialize Prometheus metrics
fn init_metrics() -> Option<MetricsHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics enabled at /metrics");

            metrics::describe_counter!(
                "wharf_blob_pulls_total",
                "Total number of blobs served"
            );
            metrics::describe_counter!(
                "wharf_blob_pushes_total",
                "Total number of blob uploads committed"
            );
            metrics::describe_counter!(
                "wharf_manifest_pulls_total",
                "Total number of manifests served"
            );
            metrics::describe_counter!(
                "wharf_manifest_pushes_total",
                "Total number of manifests stored"
            );
            metrics::describe_counter!(
                "wharf_uploads_started_total",
                "Total number of upload sessions opened"
            );

            Some(handle)
        }
        Err(e) => {
            tracing::warn!("Failed to initialize Prometheus metrics: {}", e);
            None
        }
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}
