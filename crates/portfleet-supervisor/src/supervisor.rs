//! Tunnel supervisor
//!
//! Starts one tunnel task per workspace, drains the shared error sink and, on
//! any fatal signal, re-probes every registered workspace and resets only the
//! ones found unhealthy.
//!
//! Recheck policy: a signal is never used to pick the failed workspace, even
//! when it carries an attribution. Provider errors are not reliably tied to
//! one session (a dial failure inside one forward can mean the whole network
//! path is down), so every signal runs a full pass over all workspaces.

use futures::future::join_all;
use portfleet_proto::{WorkspaceLocalId, WorkspaceTarget, DEFAULT_REMOTE_PORT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::StartError;
use crate::handle::TunnelHandle;
use crate::health::HealthChecker;
use crate::ports::PortAssigner;
use crate::provider::{ErrorSink, FatalSignal, TunnelProvider, TunnelSession};
use crate::registry::{ConnectionRegistry, ResetDecision, TunnelStatus};

/// Default number of resets allowed per workspace per run
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Resets allowed per workspace before it is left down
    pub retry_budget: u32,
    /// How long shutdown waits for tunnel tasks to finish
    pub shutdown_grace: Duration,
    /// Workspace port every tunnel forwards to
    pub remote_port: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            shutdown_grace: Duration::from_secs(5),
            remote_port: DEFAULT_REMOTE_PORT,
        }
    }
}

/// What `reset_unhealthy` did for a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Handle closed and a new session started on `port`
    Restarted { remaining: u32, port: u16 },
    /// Handle closed, budget consumed, but the restart could not start
    RestartFailed { remaining: u32 },
    /// Budget spent, workspace stays down
    Exhausted,
    /// Workspace was never started
    Unknown,
}

/// Result of a coordinated shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Handles that were still open and got closed
    pub closed: usize,
    /// Whether every tunnel task finished within the grace period
    pub drained: bool,
}

/// Owns the lifecycle of every workspace tunnel
pub struct Supervisor {
    config: SupervisorConfig,
    provider: Arc<dyn TunnelProvider>,
    health: Arc<dyn HealthChecker>,
    ports: PortAssigner,
    registry: ConnectionRegistry,
    sink: ErrorSink,
    signals: Mutex<Option<mpsc::Receiver<FatalSignal>>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        provider: Arc<dyn TunnelProvider>,
        health: Arc<dyn HealthChecker>,
        ports: PortAssigner,
    ) -> Arc<Self> {
        let (sink, signals) = ErrorSink::channel();
        Arc::new(Self {
            config,
            provider,
            health,
            ports,
            registry: ConnectionRegistry::new(),
            sink,
            signals: Mutex::new(Some(signals)),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The shared sink fatal errors are funneled into
    pub fn error_sink(&self) -> ErrorSink {
        self.sink.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start one tunnel per target
    ///
    /// Starting a target that is already registered replaces (and closes) its
    /// previous handle. A target whose local id collides with a different
    /// registered workspace is skipped. Returns how many tunnels were started.
    pub async fn start(self: &Arc<Self>, targets: &[WorkspaceTarget]) -> usize {
        if targets.is_empty() {
            info!("No workspaces to tunnel");
            return 0;
        }

        self.ports.reserve_configured(targets);

        let mut started = 0;
        for target in targets {
            let local_id = target.local_id();
            self.registry
                .ensure_budget(&local_id, self.config.retry_budget)
                .await;

            match self.start_tunnel(target).await {
                Ok(_) => started += 1,
                Err(e) => error!("[{}] Failed to start tunnel: {}", local_id, e),
            }
        }

        info!("Started {} of {} tunnel(s)", started, targets.len());
        started
    }

    /// Open a session for one target and register its handle
    async fn start_tunnel(self: &Arc<Self>, target: &WorkspaceTarget) -> Result<u16, StartError> {
        if self.is_shutting_down() {
            return Err(StartError::ShuttingDown);
        }

        let local_id = target.local_id();
        let local_port = self.ports.resolve_port(target)?;
        let token = self.shutdown.child_token();

        let session = self
            .registry
            .replace(TunnelHandle::new(target.clone(), local_port, token.clone()))
            .await?;

        info!(
            "[{}] Forwarding 127.0.0.1:{} -> {} (session {})",
            local_id,
            local_port,
            target.ssh_address(self.config.remote_port),
            session
        );

        let tunnel = TunnelSession {
            target: target.clone(),
            local_port,
            remote_port: self.config.remote_port,
            cancel: token.clone(),
            errors: self.sink.clone(),
        };
        let supervisor = Arc::clone(self);

        self.tasks.spawn(async move {
            let result = supervisor.provider.open(tunnel).await;

            if token.is_cancelled() {
                debug!("[{}] Session {} closed", local_id, session);
                return;
            }

            let reason = match result {
                Ok(()) => "stream ended unexpectedly".to_string(),
                Err(e) => e.to_string(),
            };
            error!("[{}] Tunnel failed: {}", local_id, reason);
            supervisor.registry.close_session(&local_id, session).await;
            supervisor
                .sink
                .report(FatalSignal::attributed(local_id, reason));
        });

        Ok(local_port)
    }

    /// Drain the error sink until shutdown
    ///
    /// Only one health loop can run per supervisor; a second call returns
    /// immediately.
    pub async fn run_health_loop(self: Arc<Self>) {
        let Some(mut signals) = self.signals.lock().await.take() else {
            warn!("Health loop is already running");
            return;
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Health loop stopping");
                    break;
                }
                signal = signals.recv() => {
                    let Some(signal) = signal else { break };
                    match &signal.local_id {
                        Some(local_id) => warn!(
                            "Fatal tunnel error reported by [{}]: {}",
                            local_id, signal.error
                        ),
                        None => warn!("Fatal tunnel error reported: {}", signal.error),
                    }
                    info!("Resetting unhealthy connections");
                    self.recheck_all().await;
                }
            }
        }
    }

    /// Probe every registered workspace and reset the unhealthy ones
    ///
    /// Returns the workspaces that were found unhealthy.
    pub async fn recheck_all(self: &Arc<Self>) -> Vec<WorkspaceLocalId> {
        let targets = self.registry.targets().await;
        let results = join_all(targets.iter().map(|t| self.health.probe(t))).await;

        let mut unhealthy = Vec::new();
        for (target, result) in targets.iter().zip(results) {
            let local_id = target.local_id();
            if result.healthy {
                debug!("[{}] Healthy", local_id);
                continue;
            }

            warn!(
                "[{}] Unhealthy: {}",
                local_id,
                result.reason.as_deref().unwrap_or("no reason given")
            );
            self.reset_unhealthy(target).await;
            unhealthy.push(local_id);
        }
        unhealthy
    }

    /// Close a workspace's tunnel and restart it if budget remains
    pub async fn reset_unhealthy(self: &Arc<Self>, target: &WorkspaceTarget) -> ResetOutcome {
        let local_id = target.local_id();

        match self.registry.reset(&local_id).await {
            ResetDecision::Retry { remaining } => {
                info!(
                    "[{}] Resetting tunnel ({} retries left)",
                    local_id, remaining
                );
                match self.start_tunnel(target).await {
                    Ok(port) => ResetOutcome::Restarted { remaining, port },
                    Err(e) => {
                        error!("[{}] Restart failed: {}", local_id, e);
                        ResetOutcome::RestartFailed { remaining }
                    }
                }
            }
            ResetDecision::Exhausted { first } => {
                if first {
                    error!(
                        "[{}] Retries exhausted, leaving workspace down for this run",
                        local_id
                    );
                }
                ResetOutcome::Exhausted
            }
            ResetDecision::Unknown => {
                warn!("[{}] Reset requested for unknown workspace", local_id);
                ResetOutcome::Unknown
            }
        }
    }

    /// Snapshot of every registered tunnel
    pub async fn status(&self) -> Vec<TunnelStatus> {
        self.registry.status().await
    }

    /// Cancel every session and wait for the tunnel tasks to finish
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown.cancel();
        let closed = self.registry.close_all().await;
        self.tasks.close();

        let drained = tokio::time::timeout(self.config.shutdown_grace, self.tasks.wait())
            .await
            .is_ok();

        if drained {
            info!("All tunnels stopped");
        } else {
            warn!(
                "{} tunnel task(s) still running after {:?}",
                self.tasks.len(),
                self.config.shutdown_grace
            );
        }

        ShutdownReport { closed, drained }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::health::ProbeResult;
    use async_trait::async_trait;
    use portfleet_proto::{ConfiguredPortStore, PortStoreError};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct NoPorts;

    impl ConfiguredPortStore for NoPorts {
        fn get_port(&self, _local_id: &WorkspaceLocalId) -> Result<Option<u16>, PortStoreError> {
            Ok(None)
        }
    }

    /// Blocks until cancelled, counting opens per workspace
    #[derive(Default)]
    struct IdleProvider {
        opens: StdMutex<Vec<WorkspaceLocalId>>,
    }

    impl IdleProvider {
        fn opens_for(&self, local_id: &WorkspaceLocalId) -> usize {
            self.opens
                .lock()
                .unwrap()
                .iter()
                .filter(|id| *id == local_id)
                .count()
        }
    }

    #[async_trait]
    impl TunnelProvider for IdleProvider {
        async fn open(&self, session: TunnelSession) -> Result<(), ProviderError> {
            self.opens.lock().unwrap().push(session.local_id());
            session.cancel.cancelled().await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedHealth {
        down: StdMutex<HashSet<String>>,
    }

    impl ScriptedHealth {
        fn mark_down(&self, local_id: &WorkspaceLocalId) {
            self.down.lock().unwrap().insert(local_id.to_string());
        }
    }

    #[async_trait]
    impl HealthChecker for ScriptedHealth {
        async fn probe(&self, target: &WorkspaceTarget) -> ProbeResult {
            if self.down.lock().unwrap().contains(target.local_id().as_str()) {
                ProbeResult::unhealthy("connection refused")
            } else {
                ProbeResult::healthy()
            }
        }
    }

    /// Fails every open immediately, as a provider that cannot bind would
    struct FailingProvider;

    #[async_trait]
    impl TunnelProvider for FailingProvider {
        async fn open(&self, session: TunnelSession) -> Result<(), ProviderError> {
            Err(ProviderError::Bind {
                port: session.local_port,
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
            })
        }
    }

    fn supervisor(
        provider: Arc<dyn TunnelProvider>,
        health: Arc<ScriptedHealth>,
        retry_budget: u32,
    ) -> Arc<Supervisor> {
        Supervisor::new(
            SupervisorConfig {
                retry_budget,
                shutdown_grace: Duration::from_secs(1),
                ..Default::default()
            },
            provider,
            health,
            PortAssigner::new(Arc::new(NoPorts)).without_bind_check(),
        )
    }

    fn targets(n: usize) -> Vec<WorkspaceTarget> {
        (0..n)
            .map(|i| {
                WorkspaceTarget::new(
                    format!("10{:02}", i),
                    format!("ws{}", i),
                    format!("ws{}.example.dev", i),
                )
            })
            .collect()
    }

    async fn wait_for_opens(provider: &IdleProvider, n: usize) {
        for _ in 0..100 {
            if provider.opens.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("provider never reached {} opens", n);
    }

    #[tokio::test]
    async fn test_start_registers_every_target() {
        for n in [0usize, 1, 4] {
            let provider = Arc::new(IdleProvider::default());
            let sup = supervisor(provider.clone(), Arc::new(ScriptedHealth::default()), 3);

            assert_eq!(sup.start(&targets(n)).await, n);
            assert_eq!(sup.registry().len().await, n);
            wait_for_opens(&provider, n).await;

            sup.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_start_again_replaces_handle() {
        let provider = Arc::new(IdleProvider::default());
        let sup = supervisor(provider.clone(), Arc::new(ScriptedHealth::default()), 3);
        let ws = targets(1);
        let id = ws[0].local_id();

        sup.start(&ws).await;
        let first = sup.registry().session(&id).await.unwrap();
        sup.start(&ws).await;
        let second = sup.registry().session(&id).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(sup.registry().len().await, 1);
        // Budget is not refilled by a second start
        assert_eq!(sup.registry().remaining_retries(&id).await, Some(3));
        wait_for_opens(&provider, 2).await;

        let report = sup.shutdown().await;
        assert_eq!(report.closed, 1);
        assert!(report.drained);
    }

    #[tokio::test]
    async fn test_colliding_local_ids_keep_first_workspace() {
        let provider = Arc::new(IdleProvider::default());
        let sup = supervisor(provider.clone(), Arc::new(ScriptedHealth::default()), 3);
        let first = WorkspaceTarget::new("aaaa6789", "main", "a.example.dev");
        let second = WorkspaceTarget::new("bbbb6789", "main", "b.example.dev");
        let id = first.local_id();

        assert_eq!(sup.start(&[first, second]).await, 1);
        assert_eq!(sup.registry().len().await, 1);
        assert_eq!(sup.registry().targets().await[0].id, "aaaa6789");
        assert!(sup.registry().is_open(&id).await);
        assert_eq!(sup.registry().session(&id).await, Some(1));

        wait_for_opens(&provider, 1).await;
        assert_eq!(provider.opens_for(&id), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_provider_marks_handle_closed() {
        let sup = supervisor(
            Arc::new(FailingProvider),
            Arc::new(ScriptedHealth::default()),
            3,
        );
        let ws = targets(1);
        let id = ws[0].local_id();
        sup.start(&ws).await;

        for _ in 0..100 {
            if !sup.registry().is_open(&id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = sup.status().await;
        assert!(!status[0].open);
        assert_eq!(status[0].session, 1);
        // Nothing was reset, so the budget is untouched
        assert_eq!(status[0].remaining_retries, 3);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_until_exhausted() {
        let provider = Arc::new(IdleProvider::default());
        let sup = supervisor(provider.clone(), Arc::new(ScriptedHealth::default()), 2);
        let ws = targets(1);
        let id = ws[0].local_id();
        sup.start(&ws).await;

        let port = sup.status().await[0].local_port;
        assert_eq!(
            sup.reset_unhealthy(&ws[0]).await,
            ResetOutcome::Restarted { remaining: 1, port }
        );
        assert_eq!(
            sup.reset_unhealthy(&ws[0]).await,
            ResetOutcome::Restarted { remaining: 0, port }
        );
        assert_eq!(sup.reset_unhealthy(&ws[0]).await, ResetOutcome::Exhausted);
        let after_first_exhaust = sup.status().await;

        // Repeated resets on an exhausted workspace change nothing
        assert_eq!(sup.reset_unhealthy(&ws[0]).await, ResetOutcome::Exhausted);
        assert_eq!(sup.status().await, after_first_exhaust);
        assert!(!sup.registry().is_open(&id).await);
        assert_eq!(sup.registry().remaining_retries(&id).await, Some(0));

        wait_for_opens(&provider, 3).await;
        assert_eq!(provider.opens_for(&id), 3);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_recheck_resets_only_unhealthy() {
        let provider = Arc::new(IdleProvider::default());
        let health = Arc::new(ScriptedHealth::default());
        let sup = supervisor(provider.clone(), health.clone(), 3);
        let ws = targets(3);
        sup.start(&ws).await;

        let before = sup.status().await;
        health.mark_down(&ws[1].local_id());

        let reset = sup.recheck_all().await;
        assert_eq!(reset, vec![ws[1].local_id()]);

        let after = sup.status().await;
        for (b, a) in before.iter().zip(after.iter()) {
            if a.local_id == ws[1].local_id() {
                assert_ne!(a.session, b.session);
                assert_eq!(a.remaining_retries, 2);
                assert!(a.open);
            } else {
                assert_eq!(a, b);
            }
        }
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_restart_after_shutdown() {
        let provider = Arc::new(IdleProvider::default());
        let sup = supervisor(provider, Arc::new(ScriptedHealth::default()), 3);
        let ws = targets(1);
        sup.start(&ws).await;

        sup.shutdown().await;
        assert!(matches!(
            sup.reset_unhealthy(&ws[0]).await,
            ResetOutcome::RestartFailed { remaining: 2 }
        ));
        assert_eq!(sup.start(&ws).await, 0);
    }

    #[tokio::test]
    async fn test_second_health_loop_returns() {
        let sup = supervisor(
            Arc::new(IdleProvider::default()),
            Arc::new(ScriptedHealth::default()),
            3,
        );
        let first = tokio::spawn(sup.clone().run_health_loop());
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), sup.clone().run_health_loop())
            .await
            .expect("second loop should return immediately");

        sup.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), first)
            .await
            .unwrap()
            .unwrap();
    }
}
