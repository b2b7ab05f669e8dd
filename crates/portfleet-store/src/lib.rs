//! On-disk state under `~/.portfleet/`
//!
//! - `config.json`: global settings ([`ConfigManager`])
//! - `ports.json`: local port pinned per workspace ([`PortStore`])
//! - `workspaces/<local id>.json`: known workspaces ([`WorkspaceStore`])
//! - `ssh_config`: `Host` aliases for the local tunnel ends ([`SshConfigWriter`])
//!
//! Private keys are located by [`KeyFileResolver`].

pub mod config;
pub mod credentials;
pub mod error;
pub mod ports;
pub mod ssh_config;
pub mod workspaces;

pub use config::{ConfigManager, FleetConfig, DEFAULT_SSH_USER};
pub use credentials::KeyFileResolver;
pub use error::StoreError;
pub use ports::PortStore;
pub use ssh_config::{SshConfigWriter, SshHostEntry};
pub use workspaces::WorkspaceStore;

use std::path::PathBuf;

/// Root directory for all portfleet state
pub fn fleet_dir() -> Result<PathBuf, StoreError> {
    let home = dirs::home_dir().ok_or(StoreError::HomeDir)?;
    Ok(home.join(".portfleet"))
}

/// Validate a file-backed entry name (alphanumeric, hyphens, underscores only)
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidName("name cannot be empty".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(StoreError::InvalidName(format!(
            "'{}' must contain only alphanumeric characters, hyphens, and underscores",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web-1001").is_ok());
        assert!(validate_name("web_1001").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("web 1001").is_err());
    }
}
