//! Server lifecycle management
//!
//! Binds the HTTP/WebSocket listener, waits for a shutdown signal, then
//! stops accepting, closes live connections and waits for the listener and
//! every connection task up to the configured grace period.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use relaychat_api::{create_router, AppState};
use relaychat_core::Config;
use relaychat_hub::RelayEngine;

/// Relay server: owns the listener task and the state it serves
pub struct RelayServer {
    config: Config,
    state: AppState,
}

impl RelayServer {
    #[must_use]
    pub fn new(config: Config, engine: RelayEngine) -> Self {
        let state = AppState::new(engine, config.server.max_frame_bytes);
        Self { config, state }
    }

    /// Bind the configured address and serve until SIGINT/SIGTERM
    pub async fn start(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let listener = TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves, then shut down in order
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        info!("Starting relay server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut http_handle = self.start_http_server(listener, shutdown_rx)?;

        info!("Relay server started");

        let stopped_early = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                true
            }
            () = shutdown => {
                info!("Shutdown signal received, starting graceful shutdown...");
                false
            }
        };

        // Stop accepting new connections
        let _ = shutdown_tx.send(true);

        self.shutdown(http_handle, stopped_early).await;

        Ok(())
    }

    /// Close live connections, then wait for the listener and connection tasks
    async fn shutdown(&self, http_handle: JoinHandle<()>, stopped_early: bool) {
        info!("Shutting down relay server...");

        let closed = self.state.engine.shutdown().await;
        info!(connections = closed, "Live connections closed");

        let connections = &self.state.connections;
        connections.close();

        let grace = Duration::from_secs(self.config.server.shutdown_grace_seconds);
        let drained = tokio::time::timeout(grace, async {
            if !stopped_early {
                match http_handle.await {
                    Ok(()) => info!("HTTP server drained"),
                    Err(e) => error!("HTTP server task failed: {}", e),
                }
            }
            connections.wait().await;
        })
        .await;

        match drained {
            Ok(()) => info!("All connection tasks finished"),
            Err(_) => warn!(
                remaining = connections.len(),
                "Shutdown did not finish within {}s, exiting anyway",
                grace.as_secs()
            ),
        }
    }

    fn start_http_server(
        &self,
        listener: TcpListener,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_router = create_router(self.state.clone());

        let local_addr = listener.local_addr()?;
        info!("HTTP server listening on {}", local_addr);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, http_router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
