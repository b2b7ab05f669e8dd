//! Workspace directory storage
//!
//! Manages known workspaces as JSON files in ~/.portfleet/workspaces/, one
//! file per workspace named after its local id.

use async_trait::async_trait;
use portfleet_proto::{DirectoryError, WorkspaceDirectory, WorkspaceScope, WorkspaceTarget};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::StoreError;

/// Workspace directory backed by JSON files
pub struct WorkspaceStore {
    base_dir: PathBuf,
}

impl WorkspaceStore {
    /// Create a new workspace store
    pub fn new() -> Result<Self, StoreError> {
        Self::with_base_dir(crate::fleet_dir()?.join("workspaces"))
    }

    /// Create a workspace store with a custom base directory
    pub fn with_base_dir(base_dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&base_dir).map_err(|e| StoreError::io(&base_dir, e))?;
        Ok(Self { base_dir })
    }

    fn workspace_path(&self, local_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", local_id))
    }

    /// Save a workspace, returning the local id it is stored under
    pub fn save(&self, target: &WorkspaceTarget) -> Result<String, StoreError> {
        let local_id = target.local_id().to_string();
        crate::validate_name(&local_id)?;

        let path = self.workspace_path(&local_id);
        let json = serde_json::to_string_pretty(target).map_err(|e| StoreError::json(&path, e))?;
        fs::write(&path, json).map_err(|e| StoreError::io(&path, e))?;

        debug!("[{}] Saved workspace to {:?}", local_id, path);
        Ok(local_id)
    }

    /// Load a workspace by local id
    pub fn load(&self, local_id: &str) -> Result<WorkspaceTarget, StoreError> {
        crate::validate_name(local_id)?;

        let path = self.workspace_path(local_id);
        if !path.exists() {
            return Err(StoreError::NotFound(local_id.to_string()));
        }
        Self::read(&path)
    }

    /// List all workspaces, ordered by local id
    ///
    /// Files that do not parse as a workspace are logged and skipped.
    pub fn list(&self) -> Result<Vec<WorkspaceTarget>, StoreError> {
        let mut workspaces = Vec::new();

        let entries = fs::read_dir(&self.base_dir).map_err(|e| StoreError::io(&self.base_dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&self.base_dir, e))?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(workspace) => workspaces.push(workspace),
                Err(e @ StoreError::Json { .. }) => warn!("Skipping workspace file: {}", e),
                Err(e) => return Err(e),
            }
        }

        workspaces.sort_by_key(|w| w.local_id());
        Ok(workspaces)
    }

    /// Remove a workspace by local id
    pub fn remove(&self, local_id: &str) -> Result<(), StoreError> {
        crate::validate_name(local_id)?;

        let path = self.workspace_path(local_id);
        if !path.exists() {
            return Err(StoreError::NotFound(local_id.to_string()));
        }
        fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))
    }

    /// Get the base directory path (for display purposes)
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn read(path: &Path) -> Result<WorkspaceTarget, StoreError> {
        let json = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        serde_json::from_str(&json).map_err(|e| StoreError::json(path, e))
    }
}

#[async_trait]
impl WorkspaceDirectory for WorkspaceStore {
    async fn list_workspaces(
        &self,
        scope: WorkspaceScope,
    ) -> Result<Vec<WorkspaceTarget>, DirectoryError> {
        let workspaces = self
            .list()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        Ok(workspaces
            .into_iter()
            .filter(|w| scope.includes(w))
            .collect())
    }
}
