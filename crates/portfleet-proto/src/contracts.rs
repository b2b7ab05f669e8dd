//! Contracts of the collaborators consumed by the tunnel supervisor

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::workspace::{WorkspaceLocalId, WorkspaceTarget};

/// Workspace directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Credential resolution errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No private key configured or found")]
    NotFound,

    #[error("Private key {path:?} is not readable: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// Configured port store errors
#[derive(Debug, Error)]
pub enum PortStoreError {
    #[error("Port store unavailable: {0}")]
    Unavailable(String),
}

/// Which workspaces a directory listing should include
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkspaceScope {
    /// Only workspaces currently running
    #[default]
    Running,
    /// Every workspace regardless of status
    All,
}

impl WorkspaceScope {
    pub fn includes(&self, target: &WorkspaceTarget) -> bool {
        match self {
            WorkspaceScope::Running => target.status.is_running(),
            WorkspaceScope::All => true,
        }
    }
}

/// Supplies the list of workspaces to open tunnels to
#[async_trait]
pub trait WorkspaceDirectory: Send + Sync {
    async fn list_workspaces(
        &self,
        scope: WorkspaceScope,
    ) -> Result<Vec<WorkspaceTarget>, DirectoryError>;
}

/// Locates the private key used to authenticate against workspaces
pub trait CredentialResolver: Send + Sync {
    /// Path of a readable private key
    fn private_key_path(&self) -> Result<PathBuf, CredentialError>;
}

/// Per-workspace local port configuration
pub trait ConfiguredPortStore: Send + Sync {
    /// Previously configured local port for a workspace, if any
    fn get_port(&self, local_id: &WorkspaceLocalId) -> Result<Option<u16>, PortStoreError>;

    /// Remember a port drawn for a workspace so later runs reuse it
    ///
    /// Stores that cannot persist keep the default, which drops the port.
    fn save_port(&self, _local_id: &WorkspaceLocalId, _port: u16) -> Result<(), PortStoreError> {
        Ok(())
    }
}
