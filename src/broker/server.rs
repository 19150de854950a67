//! Broker HTTP server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn};

use super::Broker;
use super::handlers::create_router;
use crate::txn::spawn_reaper;
use crate::{Error, Result};

/// Run the broker server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unparseable bind host and [`Error::Io`]
/// if the listener cannot bind.
pub async fn run(broker: Broker) -> Result<()> {
    let config = broker.config().clone();
    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
        config.server.port,
    );

    // Create shutdown channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let broker = Arc::new(broker);
    let reap_interval = Duration::from_secs(config.transactions.reap_interval_secs);
    spawn_reaper(broker.transactions(), reap_interval, shutdown_tx.subscribe());

    // Downstream codes expire on their own clock
    let grants = broker.grants();
    let mut grant_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reap_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = grants.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired downstream codes");
                    }
                }
                _ = grant_shutdown.recv() => {
                    debug!("Grant reaper shutting down");
                    break;
                }
            }
        }
    });

    let app = create_router(Arc::clone(&broker));

    // Bind listener
    let listener = TcpListener::bind(addr).await?;

    info!("============================================================");
    info!("MCP OAUTH BROKER v{}", env!("CARGO_PKG_VERSION"));
    info!("============================================================");
    info!(host = %config.server.host, port = %config.server.port, "Listening");
    info!(issuer = %config.upstream.issuer_url, "Upstream provider");
    info!(clients = config.clients.len(), "Registered downstream clients");
    info!("  GET  {}/authorize", config.server.public_url);
    info!("  POST {}/consent", config.server.public_url);
    info!("  GET  {}/callback", config.server.public_url);

    if config.server.development {
        warn!("DEVELOPMENT mode - session cookies are not marked Secure");
    }
    info!("============================================================");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Broker shutdown complete");
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
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
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
