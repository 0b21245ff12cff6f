//! picrelay-server: picture relay server.
//!
//! Accepts WebSocket connections, lets clients register under a chosen
//! identifier, and relays uploaded picture references to one named peer or
//! to every connected peer.

mod config;
mod relay;
mod server;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::RelayServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// picrelay-server — picture relay server
#[derive(Parser, Debug)]
#[command(name = "picrelay-server", version, about = "Picture relay server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.picrelay/config.toml")]
    config: String,

    /// Browser origin allowed to connect (repeatable; default: any)
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting picrelay-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        allowed_origins: cli.allowed_origins,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let relay_server = RelayServer::new(server_config);
    let shutdown = relay_server.shutdown_handle();
    let mut running = tokio::spawn(relay_server.run());

    // Run until shutdown signal, then let connections say goodbye
    tokio::select! {
        result = &mut running => {
            report_exit(result);
            return;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            let _ = shutdown.send(());
        }
    }

    report_exit(running.await);
    info!("picrelay-server stopped");
}

fn report_exit(result: Result<picrelay_core::RelayResult<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "server error");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "server task failed");
            std::process::exit(1);
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
