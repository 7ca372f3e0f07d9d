//! Tracehouse collector
//!
//! Receives metric records from agents, buffers them on disk, aggregates
//! them through the stream graphs and persists the windows.
//!
//! ## Configuration
//! All configuration is done via `TRACEHOUSE_*` environment variables; see
//! [`tracehouse_server::config`] for the full list.
//!
//! ## Example Usage
//! ```bash
//! # Single member
//! TRACEHOUSE_BUFFER_PATH=./data/buffer cargo run -p tracehouse-server
//!
//! # Two members sharing persistence
//! TRACEHOUSE_SELF_ADDRESS=10.0.0.1:11800 TRACEHOUSE_SEEDS=10.0.0.2:11800 \
//!     cargo run -p tracehouse-server --release
//! ```
//!
//! ## Logging
//! Logging is controlled via the `RUST_LOG` environment variable:
//! ```bash
//! RUST_LOG=debug cargo run -p tracehouse-server    # Detailed logs
//! RUST_LOG=info cargo run -p tracehouse-server     # Standard logs (default)
//! ```

use anyhow::Context;
use tracehouse_server::{Collector, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let collector = Collector::start(config)
        .await
        .context("failed to start collector")?;

    shutdown_signal().await;
    collector.shutdown().await;

    tracing::info!("Tracehouse collector shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
