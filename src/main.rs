use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use lockerd::config::{self, Config, StoreBackend};
use lockerd::coordination::Coordinator;
use lockerd::http::{self, AppState};
use lockerd::keyspace::Channel;
use lockerd::metrics::MetricsRegistry;
use lockerd::store::memory::MemoryStore;
use lockerd::store::redis::RedisStore;
use lockerd::store::Store;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "lockerd", about = "Locker platform coordination service")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/lockerd/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Store setup
// ---------------------------------------------------------------------------

async fn build_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store)
                .await
                .with_context(|| format!("failed to connect to store at {}", config.store.endpoint))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-process store; state is not shared between instances");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(config: &Config, state: AppState) -> Result<()> {
    let app = http::create_router(Arc::new(state));

    let listen_addr: std::net::SocketAddr = config
        .server
        .listen
        .parse()
        .context("invalid server.listen address")?;

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
// Background subscribers
// ---------------------------------------------------------------------------

/// Surface fleet-wide alerts in this instance's log stream.
async fn watch_alerts(coordinator: &Coordinator) {
    for channel in [Channel::HardwareAlerts, Channel::MaintenanceAlerts] {
        let result = coordinator
            .pubsub
            .subscribe(channel, move |payload, timestamp| {
                tracing::warn!(%channel, timestamp, %payload, "alert received");
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(%channel, error = %e, "alert subscription failed, continuing without it");
        }
    }
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

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting lockerd");

    // ---- Store ----
    let store = build_store(&config).await?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Coordination layer ----
    let coordinator = Coordinator::new(store, &config, Arc::clone(&metrics.metrics));
    watch_alerts(&coordinator).await;

    // ---- Serve until signalled ----
    let state = AppState {
        coordinator: coordinator.clone(),
        metrics,
    };
    let served = run_http_server(&config, state).await;

    coordinator.shutdown().await;
    served?;

    tracing::info!("lockerd shut down cleanly");
    Ok(())
}
