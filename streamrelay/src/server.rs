use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use streamrelay_api::{create_router, AppState};
use streamrelay_core::{Config, RelayHandle};

/// How long open connections get to finish after the relay has shut down
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RelayServer {
    config: Arc<Config>,
    relay: RelayHandle,
    relay_task: JoinHandle<()>,
}

impl RelayServer {
    pub const fn new(config: Arc<Config>, relay: RelayHandle, relay_task: JoinHandle<()>) -> Self {
        Self {
            config,
            relay,
            relay_task,
        }
    }

    /// Start the HTTP server and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut http_handle = self.start_http_server(shutdown_rx).await?;

        let http_stopped = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                true
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                false
            }
        };

        // Viewers are closed and the upstream released before the listener stops
        if let Err(e) = self.relay.shutdown().await {
            warn!("Relay already stopped: {}", e);
        }
        let _ = shutdown_tx.send(true);

        if !http_stopped && tokio::time::timeout(DRAIN_TIMEOUT, &mut http_handle).await.is_err() {
            warn!("HTTP server did not drain within {:?}, aborting", DRAIN_TIMEOUT);
            http_handle.abort();
        }
        if let Err(e) = self.relay_task.await {
            error!("Relay coordinator task failed: {}", e);
        }

        info!("StreamRelay shut down");
        Ok(())
    }

    async fn start_http_server(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: std::net::SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let router = create_router(AppState::new(self.relay.clone(), Arc::clone(&self.config)));

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
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
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
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
