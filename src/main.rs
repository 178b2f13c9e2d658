// The publish service layer and parts of the storage/lock API are consumed
// by the registry's CRUD service and by tests rather than by this binary's
// own call graph.  Allow dead_code crate-wide instead of annotating each
// shared surface.
#![allow(dead_code)]

mod assign;
mod config;
mod coordination;
mod db;
mod error;
mod health;
mod http;
mod metrics;
mod pipeline;
mod publish;
mod snapshot;
mod storage;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fred::clients::Pool;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::storage::s3::SnapshotStorage;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "shardgen", about = "Package registry shard and index rebuild worker")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/shardgen/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub keydb: Pool,
    pub db: sqlx::PgPool,
    pub storage: Arc<SnapshotStorage>,
    pub metrics: MetricsRegistry,
    pub worker_id: String,
}

// ---------------------------------------------------------------------------
// S3 client setup
// ---------------------------------------------------------------------------

async fn build_s3_client(config: &Config) -> Result<aws_sdk_s3::Client> {
    let mut aws_config_loader =
        aws_config::from_env().region(aws_config::Region::new(config.storage.region.clone()));

    if config.storage.use_fips {
        aws_config_loader = aws_config_loader.use_fips(true);
    }

    if let Some(ref endpoint) = config.storage.endpoint {
        aws_config_loader = aws_config_loader.endpoint_url(endpoint.clone());
    }

    let aws_config = aws_config_loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let client = aws_sdk_s3::Client::from_conf(s3_config);
    tracing::info!(
        bucket = %config.storage.bucket,
        region = %config.storage.region,
        fips = config.storage.use_fips,
        "S3 client initialised"
    );
    Ok(client)
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::create_router(state.clone());

    let listen_addr: std::net::SocketAddr = state
        .config
        .service
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    tracing::info!(config_path = %cli.config, "starting shardgen");

    // ---- Infrastructure clients ----
    let keydb = coordination::redis::create_keydb_pool(&config.keydb).await?;
    let db = db::connect_pool(&config.database).await?;
    let s3 = build_s3_client(&config).await?;
    let storage = Arc::new(SnapshotStorage::new(
        s3,
        config.storage.bucket.clone(),
        config.storage.public_base_url.clone(),
    ));

    // ---- Shard rows ----
    db::shards::provision_shards(&db, config.shards.count).await?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Worker identity ----
    let worker_id = coordination::node::worker_id();
    tracing::info!(%worker_id, "worker identity established");

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        keydb,
        db,
        storage,
        metrics,
        worker_id,
    };

    // ---- Spawn background loops ----
    let job_handle = tokio::spawn({
        let s = state.clone();
        async move { worker::run_job_loop(s).await }
    });

    let sweep_handle = tokio::spawn({
        let s = state.clone();
        async move { worker::run_pending_sweep(s).await }
    });

    let heartbeat_handle = tokio::spawn({
        let pool = state.keydb.clone();
        let id = state.worker_id.clone();
        async move { coordination::node::run_heartbeat(pool, id).await }
    });

    // ---- HTTP server (runs until shutdown signal) ----
    let serve_result = run_http_server(state.clone()).await;

    // ---- Wind down ----
    // The background loops have no shutdown channel of their own; once the
    // HTTP server has drained we stop them and drop our fleet registration.
    job_handle.abort();
    sweep_handle.abort();
    heartbeat_handle.abort();

    if let Err(e) = coordination::node::deregister_worker(&state.keydb, &state.worker_id).await {
        tracing::warn!(error = %e, "worker deregistration failed");
    }

    serve_result?;
    tracing::info!("shardgen shut down cleanly");
    Ok(())
}
