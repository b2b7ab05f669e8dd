//! Connection registry: current tunnel handle and retry budget per workspace
//!
//! All state lives behind a single `RwLock`. Writers (start, reset, shutdown)
//! take the write lock; the health loop only takes the read lock long enough
//! to copy a snapshot of the registered targets.

use portfleet_proto::{WorkspaceLocalId, WorkspaceTarget};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StartError;
use crate::handle::TunnelHandle;

/// Remaining reconnection attempts for one workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u32,
    exhausted_reported: bool,
}

impl RetryBudget {
    pub fn new(attempts: u32) -> Self {
        Self {
            remaining: attempts,
            exhausted_reported: false,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Take one attempt, returning what is left, or `None` at zero
    pub fn try_consume(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.remaining)
    }
}

/// Outcome of closing a workspace's handle for a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetDecision {
    /// Budget granted one more attempt
    Retry { remaining: u32 },
    /// Budget is spent; `first` is true only the first time this is returned
    Exhausted { first: bool },
    /// Workspace was never registered
    Unknown,
}

/// Point-in-time view of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub local_id: WorkspaceLocalId,
    pub local_port: u16,
    pub open: bool,
    pub session: u64,
    pub remaining_retries: u32,
}

#[derive(Default)]
struct RegistryState {
    handles: HashMap<WorkspaceLocalId, TunnelHandle>,
    budgets: HashMap<WorkspaceLocalId, RetryBudget>,
    next_session: u64,
}

/// Shared map from workspace to its current tunnel handle
#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle, closing any previous handle for the same workspace
    ///
    /// Returns the session number assigned to the new handle. A handle whose
    /// local id is already held by a different workspace id is refused and
    /// the registered one is left untouched.
    pub async fn replace(&self, mut handle: TunnelHandle) -> Result<u64, StartError> {
        let local_id = handle.local_id();
        let mut state = self.state.write().await;

        if let Some(existing) = state.handles.get(&local_id) {
            if existing.target().id != handle.target().id {
                return Err(StartError::Conflict {
                    local_id,
                    registered: existing.target().id.clone(),
                });
            }
        }

        state.next_session += 1;
        let session = state.next_session;
        handle.set_session(session);

        if let Some(previous) = state.handles.insert(local_id.clone(), handle) {
            if previous.close() {
                debug!(
                    "[{}] Closed previous session {} before replacing it",
                    local_id,
                    previous.session()
                );
            }
        }

        Ok(session)
    }

    /// Close a handle if it is still the given session
    ///
    /// `false` if the workspace has moved on to a newer session or the handle
    /// was already closed.
    pub async fn close_session(&self, local_id: &WorkspaceLocalId, session: u64) -> bool {
        let state = self.state.read().await;
        state
            .handles
            .get(local_id)
            .filter(|handle| handle.session() == session)
            .map(|handle| handle.close())
            .unwrap_or(false)
    }

    /// Close every handle, returning how many were still open
    pub async fn close_all(&self) -> usize {
        let state = self.state.read().await;
        state.handles.values().filter(|h| h.close()).count()
    }

    /// Initialize a workspace's retry budget unless it already has one
    pub async fn ensure_budget(&self, local_id: &WorkspaceLocalId, attempts: u32) {
        let mut state = self.state.write().await;
        state
            .budgets
            .entry(local_id.clone())
            .or_insert_with(|| RetryBudget::new(attempts));
    }

    /// Close the handle and consume one retry in a single critical section
    pub async fn reset(&self, local_id: &WorkspaceLocalId) -> ResetDecision {
        let mut state = self.state.write().await;

        if let Some(handle) = state.handles.get(local_id) {
            if !handle.close() {
                debug!("[{}] Handle already closed", local_id);
            }
        }

        let Some(budget) = state.budgets.get_mut(local_id) else {
            return ResetDecision::Unknown;
        };

        match budget.try_consume() {
            Some(remaining) => ResetDecision::Retry { remaining },
            None => {
                let first = !budget.exhausted_reported;
                budget.exhausted_reported = true;
                ResetDecision::Exhausted { first }
            }
        }
    }

    /// Snapshot of every registered target, ordered by local id
    pub async fn targets(&self) -> Vec<WorkspaceTarget> {
        let state = self.state.read().await;
        let mut targets: Vec<WorkspaceTarget> = state
            .handles
            .values()
            .map(|h| h.target().clone())
            .collect();
        targets.sort_by_key(|t| t.local_id());
        targets
    }

    pub async fn remaining_retries(&self, local_id: &WorkspaceLocalId) -> Option<u32> {
        let state = self.state.read().await;
        state.budgets.get(local_id).map(|b| b.remaining())
    }

    pub async fn is_open(&self, local_id: &WorkspaceLocalId) -> bool {
        let state = self.state.read().await;
        state
            .handles
            .get(local_id)
            .map(|h| !h.is_closed())
            .unwrap_or(false)
    }

    pub async fn session(&self, local_id: &WorkspaceLocalId) -> Option<u64> {
        let state = self.state.read().await;
        state.handles.get(local_id).map(|h| h.session())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.handles.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.handles.is_empty()
    }

    pub async fn status(&self) -> Vec<TunnelStatus> {
        let state = self.state.read().await;
        let mut status: Vec<TunnelStatus> = state
            .handles
            .iter()
            .map(|(local_id, handle)| TunnelStatus {
                local_id: local_id.clone(),
                local_port: handle.local_port(),
                open: !handle.is_closed(),
                session: handle.session(),
                remaining_retries: state
                    .budgets
                    .get(local_id)
                    .map(|b| b.remaining())
                    .unwrap_or(0),
            })
            .collect();
        status.sort_by(|a, b| a.local_id.cmp(&b.local_id));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn target(id: &str, name: &str) -> WorkspaceTarget {
        WorkspaceTarget::new(id, name, format!("{}.example.dev", name))
    }

    fn handle(target: &WorkspaceTarget, port: u16) -> (TunnelHandle, CancellationToken) {
        let token = CancellationToken::new();
        (
            TunnelHandle::new(target.clone(), port, token.clone()),
            token,
        )
    }

    #[test]
    fn test_retry_budget_never_negative() {
        let mut budget = RetryBudget::new(2);
        assert_eq!(budget.try_consume(), Some(1));
        assert_eq!(budget.try_consume(), Some(0));
        assert!(budget.is_exhausted());
        assert_eq!(budget.try_consume(), None);
        assert_eq!(budget.remaining(), 0);
    }

    #[tokio::test]
    async fn test_replace_closes_previous_handle() {
        let registry = ConnectionRegistry::new();
        let web = target("1001", "web");

        let (first, first_token) = handle(&web, 4000);
        let (second, second_token) = handle(&web, 4000);

        let s1 = registry.replace(first).await.unwrap();
        let s2 = registry.replace(second).await.unwrap();

        assert!(s2 > s1);
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.session(&web.local_id()).await, Some(s2));
    }

    #[tokio::test]
    async fn test_replace_refuses_local_id_collision() {
        let registry = ConnectionRegistry::new();
        let first = target("aaaa6789", "main");
        let second = target("bbbb6789", "main");
        assert_eq!(first.local_id(), second.local_id());

        let (h1, first_token) = handle(&first, 4000);
        let (h2, second_token) = handle(&second, 4001);
        let s1 = registry.replace(h1).await.unwrap();

        let err = registry.replace(h2).await.unwrap_err();
        assert!(matches!(
            err,
            StartError::Conflict { ref registered, .. } if registered == "aaaa6789"
        ));
        assert!(!first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.session(&first.local_id()).await, Some(s1));
        assert_eq!(registry.targets().await[0].id, "aaaa6789");
    }

    #[tokio::test]
    async fn test_close_session_ignores_stale_session() {
        let registry = ConnectionRegistry::new();
        let web = target("1001", "web");
        let id = web.local_id();

        let (h1, _) = handle(&web, 4000);
        let s1 = registry.replace(h1).await.unwrap();
        let (h2, token) = handle(&web, 4000);
        let s2 = registry.replace(h2).await.unwrap();

        assert!(!registry.close_session(&id, s1).await);
        assert!(!token.is_cancelled());

        assert!(registry.close_session(&id, s2).await);
        assert!(!registry.close_session(&id, s2).await);
        assert!(!registry.is_open(&id).await);
        assert!(!registry.close_session(&WorkspaceLocalId::from("missing"), 1).await);
    }

    #[tokio::test]
    async fn test_reset_consumes_budget_until_exhausted() {
        let registry = ConnectionRegistry::new();
        let web = target("1001", "web");
        let id = web.local_id();
        let (h, token) = handle(&web, 4000);
        registry.replace(h).await.unwrap();
        registry.ensure_budget(&id, 1).await;

        assert_eq!(
            registry.reset(&id).await,
            ResetDecision::Retry { remaining: 0 }
        );
        assert!(token.is_cancelled());

        assert_eq!(
            registry.reset(&id).await,
            ResetDecision::Exhausted { first: true }
        );
        assert_eq!(
            registry.reset(&id).await,
            ResetDecision::Exhausted { first: false }
        );
        assert_eq!(registry.remaining_retries(&id).await, Some(0));
    }

    #[tokio::test]
    async fn test_ensure_budget_does_not_refill() {
        let registry = ConnectionRegistry::new();
        let id = WorkspaceLocalId::from("web-1001");

        registry.ensure_budget(&id, 3).await;
        registry.reset(&id).await;
        registry.ensure_budget(&id, 3).await;

        assert_eq!(registry.remaining_retries(&id).await, Some(2));
    }

    #[tokio::test]
    async fn test_reset_unknown_workspace() {
        let registry = ConnectionRegistry::new();
        assert_eq!(
            registry.reset(&WorkspaceLocalId::from("nope")).await,
            ResetDecision::Unknown
        );
    }

    #[tokio::test]
    async fn test_targets_snapshot_and_status() {
        let registry = ConnectionRegistry::new();
        let web = target("1001", "web");
        let db = target("2002", "db");

        for (t, port) in [(&web, 4000), (&db, 5000)] {
            let (h, _) = handle(t, port);
            registry.replace(h).await.unwrap();
            registry.ensure_budget(&t.local_id(), 3).await;
        }

        let targets = registry.targets().await;
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "db");
        assert_eq!(targets[1].name, "web");

        assert_eq!(registry.close_all().await, 2);
        assert_eq!(registry.close_all().await, 0);

        let status = registry.status().await;
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| !s.open && s.remaining_retries == 3));
        assert_eq!(status[0].local_port, 5000);
    }
}
