//! Inference Sidecar - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use inference_sidecar::{
    EmbedClient, GenerateClient, Launcher, ReadinessGate, ServerGuard, SidecarConfig, api, metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "inference-sidecar")]
#[command(about = "Launcher and loopback proxy for inference servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting inference sidecar");

    // Load configuration
    let mut config = SidecarConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        role = ?config.server.role,
        model = %config.server.model_id,
        server_port = config.server.port,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Launch the inference server subprocess
    let launcher = Launcher::new();
    let handle = launcher
        .spawn(config.server.clone())
        .await
        .context("Failed to launch inference server")?;

    let guard = ServerGuard::new(
        handle.clone(),
        Duration::from_secs(config.graceful_shutdown_timeout_secs),
    );

    // Block until the upstream listener accepts connections. With no
    // attempt limit configured this polls until the subprocess either
    // comes up or exits.
    let gate = ReadinessGate::new(&config.readiness);
    if let Err(e) = gate.wait(&handle).await {
        tracing::error!(error = %e, "server failed to become ready");
        guard.shutdown().await?;
        return Err(e.into());
    }

    tracing::info!("Webserver ready");

    // Setup API
    let embed = Arc::new(EmbedClient::new(config.server.port, &config.embedding)?);
    let generate = Arc::new(GenerateClient::new(config.server.port, &config.generation)?);

    let app_state = api::AppState {
        handle: handle.clone(),
        embed,
        generate,
        in_flight: Arc::new(AtomicUsize::new(0)),
        prometheus_handle,
    };

    let app = api::create_router(app_state, config.max_concurrent_requests);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    // Stop the inference server subprocess
    guard.shutdown().await?;
    metrics::update_runner_count(0);

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
