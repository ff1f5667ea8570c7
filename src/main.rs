//! visgate - deployment gateway for serverless GPU inference
//!
//! Accepts deployment requests, provisions RunPod serverless endpoints for
//! Hugging Face diffusion models, and notifies callers when they are live.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use visgate::Settings;

#[derive(Parser, Debug)]
#[command(name = "visgate")]
#[command(about = "Deployment gateway for serverless GPU inference")]
struct Args {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::from_env();
    if let Some(port) = args.port {
        settings.port = port;
    }

    let filter = if args.verbose {
        EnvFilter::new("visgate=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_ascii_lowercase()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting visgate");

    // Metrics exporter on its own port when enabled.
    if settings.metrics_port > 0 {
        if let Some(handle) = visgate::telemetry::install() {
            let metrics_addr = format!("0.0.0.0:{}", settings.metrics_port);
            let listener = TcpListener::bind(&metrics_addr)
                .await
                .with_context(|| format!("Failed to bind metrics to {metrics_addr}"))?;
            info!(addr = %metrics_addr, "Serving metrics");
            let metrics_app = axum::Router::new().route(
                "/metrics",
                axum::routing::get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, metrics_app).await {
                    tracing::error!(error = %e, "Metrics server error");
                }
            });
        }
    }

    let port = settings.port;
    let (app, _engine) = visgate::build_app(settings)
        .await
        .context("Failed to build application")?;

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(addr = %addr, "Listening for requests");
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
