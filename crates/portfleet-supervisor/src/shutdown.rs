//! Termination handling

use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::supervisor::{ShutdownReport, Supervisor};

/// Waits for a termination signal and drains the supervisor
pub struct ShutdownController {
    supervisor: Arc<Supervisor>,
}

impl ShutdownController {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Resolve on Ctrl+C, or SIGTERM on unix
    pub async fn wait_for_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                    return;
                }
                Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
            }
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    }

    /// Wait for `signal`, then close every tunnel and wait for the drain
    pub async fn run<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        signal.await;
        info!("Shutting down tunnels...");
        self.supervisor.shutdown().await
    }
}
