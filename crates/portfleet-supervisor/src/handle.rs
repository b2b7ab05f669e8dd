//! Close-once cancellation handles for tunnel sessions

use portfleet_proto::{WorkspaceLocalId, WorkspaceTarget};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Handle for a running tunnel session
///
/// Owned by the registry entry of its workspace. Closing cancels the
/// session's token; only the first close has an effect.
#[derive(Debug)]
pub struct TunnelHandle {
    target: WorkspaceTarget,
    local_port: u16,
    token: CancellationToken,
    closed: AtomicBool,
    /// Registry-assigned session number, set on insertion
    session: u64,
}

impl TunnelHandle {
    pub fn new(target: WorkspaceTarget, local_port: u16, token: CancellationToken) -> Self {
        Self {
            target,
            local_port,
            token,
            closed: AtomicBool::new(false),
            session: 0,
        }
    }

    /// Close the handle, cancelling its session
    ///
    /// Returns `false` if the handle was already closed. Never panics, so a
    /// reset and a shutdown racing on the same handle are both safe.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.token.cancel();
            true
        } else {
            false
        }
    }

    /// Closed explicitly or cancelled through a parent token
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.token.is_cancelled()
    }

    pub fn target(&self) -> &WorkspaceTarget {
        &self.target
    }

    pub fn local_id(&self) -> WorkspaceLocalId {
        self.target.local_id()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub(crate) fn set_session(&mut self, session: u64) {
        self.session = session;
    }
}
