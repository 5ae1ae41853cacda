use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use imagevault::config::Config;
use imagevault::{http, Context};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Stores guest images and serves them over HTTP.
#[derive(Debug, Parser)]
#[command(name = "imagevault", version, about)]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, env = "IMAGEVAULT_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Overrides the listen address of the config file
    #[arg(long)]
    address: Option<String>,

    /// Overrides the listen port of the config file
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_file(&args.config)?;
    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let addr = config.socket_addr()?;

    let ctx = Context::new(&config)
        .await
        .context("failed to set up stores")?;
    let ctx = Arc::new(ctx);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, http::router(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down stores");
    ctx.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
