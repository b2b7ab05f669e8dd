//! Global configuration management
//!
//! Stores the SSH user, private key and supervisor tuning in
//! ~/.portfleet/config.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// SSH user the health probe authenticates as unless configured
///
/// Workspaces are plain cloud VMs rather than one provider's images, and
/// `ubuntu` is the login user stock Ubuntu cloud images ship with. Images
/// built around a dedicated account need `portfleet config set-user`.
pub const DEFAULT_SSH_USER: &str = "ubuntu";

/// Global configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// User for workspace SSH logins
    pub ssh_user: String,
    /// Explicit private key; when unset the usual ~/.ssh keys are searched
    pub private_key_path: Option<PathBuf>,
    /// Resets allowed per workspace per run
    pub retry_budget: u32,
    /// Health probe timeout in seconds
    pub probe_timeout_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            ssh_user: DEFAULT_SSH_USER.to_string(),
            private_key_path: None,
            retry_budget: 3,
            probe_timeout_secs: 5,
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for ~/.portfleet/config.json
    pub fn new() -> Result<Self, StoreError> {
        Ok(Self {
            path: crate::fleet_dir()?.join("config.json"),
        })
    }

    /// Manager for a config file at a custom path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration from disk
    pub fn load(&self) -> Result<FleetConfig, StoreError> {
        // Missing file means defaults
        if !self.path.exists() {
            return Ok(FleetConfig::default());
        }

        let json = fs::read_to_string(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        serde_json::from_str(&json).map_err(|e| StoreError::json(&self.path, e))
    }

    /// Save the configuration to disk
    pub fn save(&self, config: &FleetConfig) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let json =
            serde_json::to_string_pretty(config).map_err(|e| StoreError::json(&self.path, e))?;
        fs::write(&self.path, json).map_err(|e| StoreError::io(&self.path, e))
    }

    /// Set the SSH user
    pub fn set_user(&self, user: impl Into<String>) -> Result<(), StoreError> {
        let mut config = self.load()?;
        config.ssh_user = user.into();
        self.save(&config)
    }

    /// Set or clear the explicit private key
    pub fn set_identity(&self, path: Option<PathBuf>) -> Result<(), StoreError> {
        let mut config = self.load()?;
        config.private_key_path = path;
        self.save(&config)
    }
}
