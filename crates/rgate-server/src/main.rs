//! rgate-server: remote session gateway.
//!
//! Accepts WebSocket control channels, keeps sessions alive across
//! reconnects, and runs remote operations over pooled SSH tunnels.

use clap::Parser;
use rgate_server::{ConfigOverrides, Gateway, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// rgate-server: remote session gateway
#[derive(Parser, Debug)]
#[command(name = "rgate-server", version, about = "Remote session gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.rgate/config.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting rgate-server");

    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        max_sessions: cli.max_sessions,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let gateway = Arc::new(Gateway::new(config));
    info!(
        addr = %gateway.config().listen_addr(),
        max_sessions = gateway.config().max_sessions,
        credentials = gateway.config().credentials.len(),
        "gateway configured"
    );
    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        shutdown.cancel();
    });

    if let Err(e) = gateway.run().await {
        error!(error = %e, "gateway error");
        std::process::exit(1);
    }

    info!("rgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
