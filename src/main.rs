//! Shroud - TLS-Fronted Covert Relay
//!
//! This is the main entry point for the Shroud relay daemon.

use anyhow::Result;
use clap::Parser;
use shroud::config::load_config;
use shroud::extender::ExtenderServer;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Shroud - covert tunneling relay fronted by ordinary-looking TLS
#[derive(Parser, Debug)]
#[command(name = "shroud")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter directive, e.g. "info" or "shroud=debug"
    #[arg(long, default_value = "info")]
    log: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = load_config(&args.config)?;
    info!(
        version = shroud::VERSION,
        config = %args.config.display(),
        ports = ?config.extender.ports,
        allowed = ?config.extender.allow,
        "starting relay"
    );

    // Root cancellation token, tripped once by a termination signal.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let server = ExtenderServer::from_config(&config.extender);
    server.bind().await?.serve(cancel).await;

    Ok(())
}

/// Install the tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise the `--log` directive applies.
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if args.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}

/// Resolve when the process should shut down
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "no SIGTERM handler available, watching Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
