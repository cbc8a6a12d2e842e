use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use web_remote::config::{FileConfig, RelayConfig, load_config};
use web_remote::{Relay, app};

#[derive(Parser)]
#[command(name = "web-remote")]
#[command(about = "Relay between web remote control panels and IR instances")]
struct Cli {
    /// Config file (TOML); missing files fall back to defaults
    #[arg(long, default_value = "config/config.toml")]
    config: PathBuf,

    /// Bind address (overrides server.host)
    #[arg(long)]
    host: Option<String>,

    /// Port (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "web_remote=debug,tower_http=debug,info"
    } else {
        "web_remote=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting web remote relay");

    let mut file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }
    let config = RelayConfig::from_file(&file_config).context("Invalid configuration")?;

    if config.link.urls.is_empty() && config.broker.is_none() {
        warn!("No instance transports enabled; commands will go nowhere");
    }

    let addr = format!("{}:{}", config.server.host, config.server.port)
        .parse::<SocketAddr>()
        .context("Invalid bind address")?;

    let cancel = CancellationToken::new();
    let (state, tasks) = Relay::new(config).start(cancel.clone());
    let broker = state.broker.clone();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Web remote listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/remotes         - Remote layouts");
    info!("  GET    /api/instances       - Connected instances");
    info!("  GET    /health              - Health check");
    info!("  GET    /metrics             - Relay metrics");
    info!("  WS     /  or  /ws           - Control panel socket");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    if let Some(broker) = broker {
        broker.disconnect();
    }
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete");
    server_result
}
