//! Portfleet tunnel supervisor
//!
//! Keeps one SSH tunnel open per workspace for the lifetime of the process.
//!
//! # Lifecycle
//!
//! 1. [`run`] checks that a private key can be resolved, then starts one
//!    tunnel per workspace on a local port picked by [`PortAssigner`].
//! 2. Tunnel providers report fatal errors into a shared [`ErrorSink`].
//! 3. Each signal makes the health loop probe every registered workspace and
//!    reset the ones found unhealthy, within a per-workspace retry budget.
//! 4. On Ctrl+C or SIGTERM every handle is closed and the tunnel tasks are
//!    drained within a grace period.

pub mod error;
pub mod handle;
pub mod health;
pub mod ports;
pub mod provider;
pub mod registry;
pub mod run;
pub mod shutdown;
pub mod supervisor;

pub use error::{PortError, ProbeError, ProviderError, StartError, SupervisorError};
pub use handle::TunnelHandle;
pub use health::{HealthChecker, ProbeResult, SshHealthChecker};
pub use ports::PortAssigner;
pub use provider::{ErrorSink, FatalSignal, TunnelProvider, TunnelSession};
pub use registry::{ConnectionRegistry, ResetDecision, RetryBudget, TunnelStatus};
pub use run::{run, run_until};
pub use shutdown::ShutdownController;
pub use supervisor::{
    ResetOutcome, ShutdownReport, Supervisor, SupervisorConfig, DEFAULT_RETRY_BUDGET,
};
