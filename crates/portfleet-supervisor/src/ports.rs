//! Local port assignment
//!
//! A configured port for a workspace always wins. Otherwise a port is drawn
//! at random from the ephemeral range, skipping ports already issued during
//! this run and ports the OS refuses to bind on loopback. A drawn port is
//! saved back to the store, so the workspace keeps it on later runs. A
//! workspace that resolves again (after a reset) gets its previously issued
//! port back.

use portfleet_proto::{
    ConfiguredPortStore, WorkspaceLocalId, WorkspaceTarget, EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::PortError;

const DEFAULT_MAX_ATTEMPTS: usize = 64;

/// Resolves the local port each workspace tunnel binds
pub struct PortAssigner {
    store: Arc<dyn ConfiguredPortStore>,
    /// local_id -> port issued this run
    issued: Mutex<HashMap<WorkspaceLocalId, u16>>,
    range_start: u16,
    range_end: u16,
    max_attempts: usize,
    check_bind: bool,
}

impl PortAssigner {
    pub fn new(store: Arc<dyn ConfiguredPortStore>) -> Self {
        Self {
            store,
            issued: Mutex::new(HashMap::new()),
            range_start: EPHEMERAL_PORT_MIN,
            range_end: EPHEMERAL_PORT_MAX,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            check_bind: true,
        }
    }

    /// Restrict random sampling to `[start, end)`
    pub fn with_range(mut self, start: u16, end: u16) -> Self {
        self.range_start = start;
        self.range_end = end.max(start.saturating_add(1));
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Skip the loopback bind check on sampled ports
    pub fn without_bind_check(mut self) -> Self {
        self.check_bind = false;
        self
    }

    fn issued(&self) -> MutexGuard<'_, HashMap<WorkspaceLocalId, u16>> {
        self.issued.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the configured ports of every target up front
    ///
    /// Keeps a random draw for an earlier workspace from landing on a port
    /// configured for a later one.
    pub fn reserve_configured(&self, targets: &[WorkspaceTarget]) {
        for target in targets {
            let local_id = target.local_id();
            match self.store.get_port(&local_id) {
                Ok(Some(port)) => self.claim(&local_id, port),
                Ok(None) => {}
                Err(e) => warn!("[{}] Configured port lookup failed: {}", local_id, e),
            }
        }
    }

    /// Local port for a workspace
    pub fn resolve_port(&self, target: &WorkspaceTarget) -> Result<u16, PortError> {
        let local_id = target.local_id();

        if let Some(port) = self.store.get_port(&local_id)? {
            self.claim(&local_id, port);
            return Ok(port);
        }

        let mut issued = self.issued();
        if let Some(port) = issued.get(&local_id) {
            return Ok(*port);
        }

        let mut rng = rand::thread_rng();
        for _ in 0..self.max_attempts {
            let port = rng.gen_range(self.range_start..self.range_end);
            if issued.values().any(|p| *p == port) {
                debug!("[{}] Port {} already issued this run", local_id, port);
                continue;
            }
            if self.check_bind && !Self::is_port_available(port) {
                debug!("[{}] Port {} is in use", local_id, port);
                continue;
            }
            issued.insert(local_id.clone(), port);
            drop(issued);

            if let Err(e) = self.store.save_port(&local_id, port) {
                warn!("[{}] Failed to save port {}: {}", local_id, port, e);
            }
            return Ok(port);
        }

        Err(PortError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    fn claim(&self, local_id: &WorkspaceLocalId, port: u16) {
        let mut issued = self.issued();
        if let Some((other, _)) = issued.iter().find(|(id, p)| **p == port && *id != local_id) {
            warn!(
                "[{}] Configured port {} is also used by {}",
                local_id, port, other
            );
        }
        issued.insert(local_id.clone(), port);
    }

    /// Check if a port can be bound on loopback right now
    fn is_port_available(port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portfleet_proto::PortStoreError;
    use std::collections::HashSet;

    #[derive(Default)]
    struct MemoryPortStore {
        ports: Mutex<HashMap<String, u16>>,
    }

    impl MemoryPortStore {
        fn with(self, local_id: &str, port: u16) -> Self {
            self.ports.lock().unwrap().insert(local_id.to_string(), port);
            self
        }
    }

    impl ConfiguredPortStore for MemoryPortStore {
        fn get_port(&self, local_id: &WorkspaceLocalId) -> Result<Option<u16>, PortStoreError> {
            Ok(self.ports.lock().unwrap().get(local_id.as_str()).copied())
        }

        fn save_port(&self, local_id: &WorkspaceLocalId, port: u16) -> Result<(), PortStoreError> {
            self.ports
                .lock()
                .unwrap()
                .insert(local_id.to_string(), port);
            Ok(())
        }
    }

    struct BrokenPortStore;

    impl ConfiguredPortStore for BrokenPortStore {
        fn get_port(&self, _local_id: &WorkspaceLocalId) -> Result<Option<u16>, PortStoreError> {
            Err(PortStoreError::Unavailable("disk on fire".to_string()))
        }
    }

    /// Reads fine but refuses every write
    struct ReadOnlyPortStore;

    impl ConfiguredPortStore for ReadOnlyPortStore {
        fn get_port(&self, _local_id: &WorkspaceLocalId) -> Result<Option<u16>, PortStoreError> {
            Ok(None)
        }

        fn save_port(&self, _local_id: &WorkspaceLocalId, _port: u16) -> Result<(), PortStoreError> {
            Err(PortStoreError::Unavailable("read-only".to_string()))
        }
    }

    fn target(id: &str, name: &str) -> WorkspaceTarget {
        WorkspaceTarget::new(id, name, format!("{}.example.dev", name))
    }

    #[test]
    fn test_configured_port_is_deterministic() {
        let web = target("1001", "web");
        let store = MemoryPortStore::default().with(web.local_id().as_str(), 2201);
        let assigner = PortAssigner::new(Arc::new(store));

        for _ in 0..5 {
            assert_eq!(assigner.resolve_port(&web).unwrap(), 2201);
        }
    }

    #[test]
    fn test_random_port_in_ephemeral_range() {
        let assigner =
            PortAssigner::new(Arc::new(MemoryPortStore::default())).without_bind_check();

        for i in 0..50 {
            let t = target(&format!("{:04}", i), "ws");
            let port = assigner.resolve_port(&t).unwrap();
            assert!((EPHEMERAL_PORT_MIN..EPHEMERAL_PORT_MAX).contains(&port));
        }
    }

    #[test]
    fn test_random_ports_do_not_collide_within_run() {
        let assigner = PortAssigner::new(Arc::new(MemoryPortStore::default()))
            .with_range(20000, 20010)
            .with_max_attempts(1000)
            .without_bind_check();

        let mut seen = HashSet::new();
        for i in 0..10 {
            let t = target(&format!("{:04}", i), "ws");
            assert!(seen.insert(assigner.resolve_port(&t).unwrap()));
        }

        // Range is now fully issued
        let extra = target("9999", "extra");
        assert!(matches!(
            assigner.resolve_port(&extra),
            Err(PortError::Exhausted { attempts: 1000 })
        ));
    }

    #[test]
    fn test_reresolve_returns_issued_port() {
        let assigner =
            PortAssigner::new(Arc::new(MemoryPortStore::default())).without_bind_check();
        let web = target("1001", "web");

        let first = assigner.resolve_port(&web).unwrap();
        assert_eq!(assigner.resolve_port(&web).unwrap(), first);
    }

    #[test]
    fn test_random_port_is_saved_for_next_run() {
        let store = Arc::new(MemoryPortStore::default());
        let web = target("1001", "web");

        let first_run = PortAssigner::new(store.clone()).without_bind_check();
        let port = first_run.resolve_port(&web).unwrap();
        assert_eq!(store.get_port(&web.local_id()).unwrap(), Some(port));

        let second_run = PortAssigner::new(store.clone())
            .with_range(20000, 20001)
            .without_bind_check();
        assert_eq!(second_run.resolve_port(&web).unwrap(), port);
    }

    #[test]
    fn test_save_failure_still_issues_port() {
        let assigner = PortAssigner::new(Arc::new(ReadOnlyPortStore)).without_bind_check();
        let web = target("1001", "web");

        let port = assigner.resolve_port(&web).unwrap();
        assert_eq!(assigner.resolve_port(&web).unwrap(), port);
    }

    #[test]
    fn test_reserved_configured_port_is_skipped_by_random_draw() {
        let db = target("2002", "db");
        let store = MemoryPortStore::default().with(db.local_id().as_str(), 30001);
        let assigner = PortAssigner::new(Arc::new(store))
            .with_range(30000, 30002)
            .with_max_attempts(500)
            .without_bind_check();

        assigner.reserve_configured(&[target("1001", "web"), db.clone()]);

        let web_port = assigner.resolve_port(&target("1001", "web")).unwrap();
        assert_eq!(web_port, 30000);
        assert_eq!(assigner.resolve_port(&db).unwrap(), 30001);
    }

    #[test]
    fn test_store_error_propagates() {
        let assigner = PortAssigner::new(Arc::new(BrokenPortStore));
        assert!(matches!(
            assigner.resolve_port(&target("1", "web")),
            Err(PortError::Store(_))
        ));
    }
}
