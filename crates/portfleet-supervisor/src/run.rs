//! Top-level entry point

use portfleet_proto::{CredentialResolver, WorkspaceTarget};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::shutdown::ShutdownController;
use crate::supervisor::Supervisor;

/// Tunnel every workspace until Ctrl+C or SIGTERM
pub async fn run(
    supervisor: Arc<Supervisor>,
    credentials: &dyn CredentialResolver,
    workspaces: &[WorkspaceTarget],
) -> Result<(), SupervisorError> {
    run_until(
        supervisor,
        credentials,
        workspaces,
        ShutdownController::wait_for_signal(),
    )
    .await
}

/// Tunnel every workspace until `signal` resolves
///
/// Fails only when the preflight credential check fails. An empty workspace
/// list returns right away without waiting for `signal`.
pub async fn run_until<F>(
    supervisor: Arc<Supervisor>,
    credentials: &dyn CredentialResolver,
    workspaces: &[WorkspaceTarget],
    signal: F,
) -> Result<(), SupervisorError>
where
    F: Future<Output = ()>,
{
    let key_path = credentials.private_key_path()?;
    debug!("Using private key {}", key_path.display());

    if workspaces.is_empty() {
        info!("No workspaces to tunnel");
        return Ok(());
    }

    supervisor.start(workspaces).await;

    let health_loop = tokio::spawn(supervisor.clone().run_health_loop());

    let report = ShutdownController::new(supervisor).run(signal).await;
    if !report.drained {
        warn!("Exiting with tunnel tasks still running");
    }

    if let Err(e) = health_loop.await {
        warn!("Health loop ended abnormally: {}", e);
    }

    Ok(())
}
