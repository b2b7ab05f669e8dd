//! Pinned local ports, kept in ~/.portfleet/ports.json keyed by local id

use portfleet_proto::{ConfiguredPortStore, PortStoreError, WorkspaceLocalId};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::StoreError;

pub struct PortStore {
    path: PathBuf,
}

impl PortStore {
    pub fn new() -> Result<Self, StoreError> {
        Ok(Self {
            path: crate::fleet_dir()?.join("ports.json"),
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All pinned ports, ordered by local id
    pub fn list(&self) -> Result<BTreeMap<String, u16>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let json = fs::read_to_string(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        serde_json::from_str(&json).map_err(|e| StoreError::json(&self.path, e))
    }

    pub fn get(&self, local_id: &str) -> Result<Option<u16>, StoreError> {
        Ok(self.list()?.get(local_id).copied())
    }

    /// Pin a workspace to a local port
    pub fn set(&self, local_id: &str, port: u16) -> Result<(), StoreError> {
        crate::validate_name(local_id)?;
        if port == 0 {
            return Err(StoreError::InvalidPort(port));
        }

        let mut ports = self.list()?;
        if let Some((other, _)) = ports.iter().find(|(id, p)| **p == port && *id != local_id) {
            debug!("Port {} is also pinned for {}", port, other);
        }
        ports.insert(local_id.to_string(), port);
        self.write(&ports)
    }

    /// Unpin a workspace; `false` if it had no pinned port
    pub fn remove(&self, local_id: &str) -> Result<bool, StoreError> {
        let mut ports = self.list()?;
        if ports.remove(local_id).is_none() {
            return Ok(false);
        }
        self.write(&ports)?;
        Ok(true)
    }

    fn write(&self, ports: &BTreeMap<String, u16>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let json =
            serde_json::to_string_pretty(ports).map_err(|e| StoreError::json(&self.path, e))?;
        fs::write(&self.path, json).map_err(|e| StoreError::io(&self.path, e))
    }
}

impl ConfiguredPortStore for PortStore {
    fn get_port(&self, local_id: &WorkspaceLocalId) -> Result<Option<u16>, PortStoreError> {
        self.get(local_id.as_str())
            .map_err(|e| PortStoreError::Unavailable(e.to_string()))
    }

    fn save_port(&self, local_id: &WorkspaceLocalId, port: u16) -> Result<(), PortStoreError> {
        self.set(local_id.as_str(), port)
            .map_err(|e| PortStoreError::Unavailable(e.to_string()))
    }
}
