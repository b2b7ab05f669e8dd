//! Portfleet shared types
//!
//! This crate defines the workspace data model and the contracts of the
//! collaborators the tunnel supervisor depends on: the workspace directory,
//! the credential resolver and the configured port store.

pub mod contracts;
pub mod workspace;

pub use contracts::{
    ConfiguredPortStore, CredentialError, CredentialResolver, DirectoryError, PortStoreError,
    WorkspaceDirectory, WorkspaceScope,
};
pub use workspace::{WorkspaceLocalId, WorkspaceStatus, WorkspaceTarget};

/// Remote port every workspace tunnel forwards to unless configured otherwise
pub const DEFAULT_REMOTE_PORT: u16 = 22;

/// Lower bound (inclusive) of the ephemeral range used for random local ports
pub const EPHEMERAL_PORT_MIN: u16 = 1024;

/// Upper bound (exclusive) of the ephemeral range used for random local ports
pub const EPHEMERAL_PORT_MAX: u16 = 65535;
