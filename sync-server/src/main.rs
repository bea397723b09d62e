//! sync-server binary entry point.
//!
//! Usage:
//! ```bash
//! sync-server --config sync-server.toml
//! ```

use anyhow::Context;
use iroh::protocol::Router;
use iroh::Endpoint;
use oplog_sync_server::auth::JwtAuthenticator;
use oplog_sync_server::cleanup::spawn_cleanup_task;
use oplog_sync_server::config::Config;
use oplog_sync_server::http::build_router;
use oplog_sync_server::protocol::{SyncProtocol, ALPN};
use oplog_sync_server::server::SyncServer;
use oplog_sync_server::storage::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = get_config_path();
    let config = load_config(&config_path)?;
    config.validate().context("invalid configuration")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        database = %config.storage.database.display(),
        "Starting sync-server"
    );

    let store = SqliteStore::new(&config.storage.database)
        .await
        .context("failed to open operation store")?;
    let authenticator =
        JwtAuthenticator::new(&config.auth.jwt_secret, config.auth.issuer.as_deref());
    let server = Arc::new(SyncServer::new(
        config.clone(),
        Arc::new(store),
        Arc::new(authenticator),
    ));

    let cleanup = spawn_cleanup_task(server.clone(), config.cleanup.clone());

    let listener = tokio::net::TcpListener::bind(&config.http.bind_address)
        .await
        .with_context(|| format!("failed to bind HTTP on {}", config.http.bind_address))?;
    tracing::info!(address = %config.http.bind_address, "HTTP endpoints listening");
    let app = build_router(server.clone());
    let http = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    let endpoint = Endpoint::builder()
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await
        .context("failed to create endpoint")?;
    tracing::info!(endpoint_id = %endpoint.id(), "Accepting sync connections");

    let router = Router::builder(endpoint)
        .accept(ALPN, SyncProtocol::new(server.clone()))
        .spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    tracing::info!("Shutting down");

    router
        .shutdown()
        .await
        .context("failed to shut down router")?;
    server.service().shutdown().await;
    cleanup.abort();
    http.abort();

    tracing::info!("Stopped");
    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sync-server.toml"))
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))
    } else {
        tracing::warn!(config = %path.display(), "Config file not found, using defaults");
        Ok(Config::default())
    }
}
