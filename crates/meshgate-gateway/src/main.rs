//! Meshgate gateway binary.
//!
//! Runs the inbound HTTP proxy server with configuration from
//! `meshgate.toml` and `MESHGATE_`-prefixed environment variables.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meshgate_core::{HttpCluster, HttpClusterGetter};
use meshgate_gateway::{GatewayConfig, HttpProxyServer};

/// Cluster lookup used when no discovery subsystem is wired in: every
/// request goes through transparent forwarding.
struct NoClusters;

impl HttpClusterGetter for NoClusters {
    fn http_cluster(&self, _host: &str) -> Option<Arc<dyn HttpCluster>> {
        None
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("meshgate gateway starting");

    let config = load_config();
    info!(listen = %config.server.listen, "configuration loaded");

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, initiating graceful shutdown");
        cancel_on_signal.cancel();
    });

    let server = HttpProxyServer::new(config.proxy_url(), Arc::new(NoClusters));
    if let Err(e) = server.serve(cancel).await {
        error!(error = %e, "gateway error");
        return Err(e.into());
    }

    info!("gateway shutdown complete");
    Ok(())
}

fn load_config() -> GatewayConfig {
    match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            info!(error = %e, "failed to load meshgate.toml, using default configuration");
            GatewayConfig::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C");
        }
        () = terminate => {
            info!("received SIGTERM");
        }
    }
}
