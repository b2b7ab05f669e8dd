//! Supervisor error types

use portfleet_proto::{CredentialError, PortStoreError, WorkspaceLocalId};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to the caller of `run`
///
/// Only preflight failures are escalated. Everything that goes wrong for a
/// single workspace is logged and handled by the reset machinery.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Preflight check failed: {0}")]
    Preflight(#[from] CredentialError),
}

/// Local port resolution errors
#[derive(Debug, Error)]
pub enum PortError {
    #[error("Configured port lookup failed: {0}")]
    Store(#[from] PortStoreError),

    #[error("No free local port found after {attempts} attempts")]
    Exhausted { attempts: usize },
}

/// Reasons a tunnel could not be started
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Port resolution failed: {0}")]
    Port(#[from] PortError),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Local id {local_id} is already used by workspace {registered}")]
    Conflict {
        local_id: WorkspaceLocalId,
        registered: String,
    },
}

/// Health probe failures
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl From<russh::Error> for ProbeError {
    fn from(err: russh::Error) -> Self {
        ProbeError::Dial(err.to_string())
    }
}

/// Unrecoverable tunnel provider failures
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream {address} unreachable: {reason}")]
    Upstream { address: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
