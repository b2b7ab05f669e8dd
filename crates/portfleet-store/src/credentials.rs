//! Private key lookup

use portfleet_proto::{CredentialError, CredentialResolver};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Key file names searched in ~/.ssh, in order of preference
const DEFAULT_KEY_NAMES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// Resolves the private key from an explicit path or the usual ~/.ssh keys
#[derive(Debug, Clone)]
pub struct KeyFileResolver {
    explicit: Option<PathBuf>,
    ssh_dir: Option<PathBuf>,
}

impl KeyFileResolver {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            ssh_dir: dirs::home_dir().map(|home| home.join(".ssh")),
        }
    }

    /// Search `ssh_dir` instead of ~/.ssh
    pub fn with_ssh_dir(mut self, ssh_dir: impl Into<PathBuf>) -> Self {
        self.ssh_dir = Some(ssh_dir.into());
        self
    }

    fn check_readable(path: &Path) -> Result<(), CredentialError> {
        File::open(path)
            .map(|_| ())
            .map_err(|e| CredentialError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

impl CredentialResolver for KeyFileResolver {
    fn private_key_path(&self) -> Result<PathBuf, CredentialError> {
        if let Some(path) = &self.explicit {
            Self::check_readable(path)?;
            return Ok(path.clone());
        }

        let ssh_dir = self.ssh_dir.as_ref().ok_or(CredentialError::NotFound)?;
        for name in DEFAULT_KEY_NAMES {
            let path = ssh_dir.join(name);
            if !path.exists() {
                continue;
            }
            Self::check_readable(&path)?;
            debug!("Found private key {:?}", path);
            return Ok(path);
        }

        Err(CredentialError::NotFound)
    }
}
