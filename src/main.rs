use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use segserver::api::{AppState, create_router};
use segserver::config::{AppConfig, LoggingConfig};
use segserver::pipeline::TotalSegmentatorCli;
use segserver::session::{SessionStore, spawn_reaper};

#[derive(Parser, Debug)]
#[command(name = "segserver")]
#[command(about = "HTTP service for volumetric segmentation of NIfTI scans")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "SEGSERVER_PORT")]
    port: Option<u16>,

    /// Address to bind to
    #[arg(short, long, env = "SEGSERVER_BIND")]
    bind: Option<String>,

    /// Config file path (optional)
    #[arg(short, long, env = "SEGSERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, env = "SEGSERVER_VERBOSE")]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, env = "SEGSERVER_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(bind) = cli.bind.clone() {
        config.server.host = bind;
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if cli.json_logs {
        config.logging.json = true;
    }

    init_logging(&config.logging);

    let sessions = Arc::new(
        SessionStore::open(&config.storage)
            .await
            .context("opening session root")?,
    );
    let pipeline = Arc::new(TotalSegmentatorCli::from_config(&config.pipeline));
    info!(
        "Pipeline: {} (fast: {}, max concurrent: {}, max queued: {})",
        config.pipeline.executable,
        config.pipeline.fast,
        config.pipeline.max_concurrent,
        config.pipeline.max_queued
    );

    let reaper = spawn_reaper(sessions.clone(), config.storage.reap_interval());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parsing listen address")?;
    let state = AppState::new(config, sessions.clone(), pipeline);
    let app = create_router(state);

    info!("Starting segserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    reaper.abort();
    if let Err(e) = sessions.shutdown().await {
        warn!("Failed to remove session root: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let level = &config.level;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("segserver={level},tower_http={level}")));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, removing sessions...");
}
