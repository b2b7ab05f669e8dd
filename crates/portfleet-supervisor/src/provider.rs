//! Tunnel provider contract and the shared fatal-error sink

use async_trait::async_trait;
use portfleet_proto::{WorkspaceLocalId, WorkspaceTarget};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;

/// Capacity of the shared error sink
///
/// A single slot: a burst of errors collapses into one pending signal, which
/// is enough because every signal triggers a recheck of all workspaces.
pub const ERROR_SINK_CAPACITY: usize = 1;

/// A fatal error reported by, or on behalf of, a tunnel session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalSignal {
    /// Workspace the error is attributed to, when known
    pub local_id: Option<WorkspaceLocalId>,
    pub error: String,
}

impl FatalSignal {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            local_id: None,
            error: error.into(),
        }
    }

    pub fn attributed(local_id: WorkspaceLocalId, error: impl Into<String>) -> Self {
        Self {
            local_id: Some(local_id),
            error: error.into(),
        }
    }
}

/// Process-wide sink for fatal tunnel errors
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<FatalSignal>,
}

impl ErrorSink {
    pub fn channel() -> (Self, mpsc::Receiver<FatalSignal>) {
        let (tx, rx) = mpsc::channel(ERROR_SINK_CAPACITY);
        (Self { tx }, rx)
    }

    /// Report an error without blocking
    ///
    /// Returns `false` when the signal was coalesced into one already pending
    /// or nobody is listening anymore.
    pub fn report(&self, signal: FatalSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(signal)) => {
                debug!("Fatal signal coalesced: {}", signal.error);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Everything a provider needs to run one tunnel session
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub target: WorkspaceTarget,
    pub local_port: u16,
    pub remote_port: u16,
    /// Cancelled when the session's handle is closed or on shutdown
    pub cancel: CancellationToken,
    /// Sink for errors that do not end the session
    pub errors: ErrorSink,
}

impl TunnelSession {
    pub fn local_id(&self) -> WorkspaceLocalId {
        self.target.local_id()
    }
}

/// Opens forwarded streams from a local port to a workspace
///
/// `open` runs for the lifetime of the session: it returns `Ok(())` once
/// `session.cancel` fires or the stream ends cleanly, and `Err` on an
/// unrecoverable failure. Failures that should trigger a health recheck
/// without ending the session go to `session.errors`.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn open(&self, session: TunnelSession) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_is_coalesced() {
        let (sink, mut rx) = ErrorSink::channel();

        assert!(sink.report(FatalSignal::new("first")));
        assert!(!sink.report(FatalSignal::new("second")));
        assert!(!sink.report(FatalSignal::new("third")));

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.error, "first");
        assert!(rx.try_recv().is_err());

        // Slot is free again
        assert!(sink.report(FatalSignal::attributed(
            WorkspaceLocalId::from("web-1001"),
            "fourth"
        )));
    }

    #[tokio::test]
    async fn test_report_after_receiver_dropped() {
        let (sink, rx) = ErrorSink::channel();
        drop(rx);
        assert!(!sink.report(FatalSignal::new("nobody listening")));
    }
}
