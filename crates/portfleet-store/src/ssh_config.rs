//! Managed ssh config for workspace tunnels
//!
//! `~/.portfleet/ssh_config` holds one `Host <local id>` block per workspace,
//! pointing at the local end of its tunnel. It is rewritten on every `up`;
//! users pull it into `~/.ssh/config` with an `Include` line.

use portfleet_proto::WorkspaceLocalId;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::StoreError;

const HEADER: &str = "# Managed by portfleet. Rewritten on every `portfleet up`, do not edit.\n";

/// One workspace alias and the local port its tunnel listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshHostEntry {
    pub local_id: WorkspaceLocalId,
    pub port: u16,
}

impl SshHostEntry {
    pub fn new(local_id: WorkspaceLocalId, port: u16) -> Self {
        Self { local_id, port }
    }
}

/// Writes the managed ssh config file
pub struct SshConfigWriter {
    path: PathBuf,
    user: String,
    identity: Option<PathBuf>,
}

impl SshConfigWriter {
    /// Writer for ~/.portfleet/ssh_config
    pub fn new(user: impl Into<String>, identity: Option<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self::with_path(
            crate::fleet_dir()?.join("ssh_config"),
            user,
            identity,
        ))
    }

    pub fn with_path(
        path: impl Into<PathBuf>,
        user: impl Into<String>,
        identity: Option<PathBuf>,
    ) -> Self {
        Self {
            path: path.into(),
            user: user.into(),
            identity,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Line to add to ~/.ssh/config
    pub fn include_line(&self) -> String {
        format!("Include {}", self.path.display())
    }

    /// Render the file contents
    ///
    /// A local id that appears twice keeps its first entry.
    pub fn render(&self, entries: &[SshHostEntry]) -> String {
        let mut out = String::from(HEADER);
        let mut seen = HashSet::new();

        for entry in entries {
            if !seen.insert(&entry.local_id) {
                warn!(
                    "[{}] Duplicate ssh config entry for port {} skipped",
                    entry.local_id, entry.port
                );
                continue;
            }

            let _ = writeln!(out);
            let _ = writeln!(out, "Host {}", entry.local_id);
            let _ = writeln!(out, "  HostName 127.0.0.1");
            let _ = writeln!(out, "  Port {}", entry.port);
            let _ = writeln!(out, "  User {}", self.user);
            if let Some(identity) = &self.identity {
                let _ = writeln!(out, "  IdentityFile \"{}\"", identity.display());
            }
            let _ = writeln!(out, "  NoHostAuthenticationForLocalhost yes");
        }

        out
    }

    /// Rewrite the managed file for `entries`
    pub fn sync(&self, entries: &[SshHostEntry]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        fs::write(&self.path, self.render(entries)).map_err(|e| StoreError::io(&self.path, e))?;

        debug!(
            "Wrote ssh config for {} workspace(s) to {:?}",
            entries.len(),
            self.path
        );
        Ok(())
    }
}
