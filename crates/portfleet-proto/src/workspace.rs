//! Workspace targets and their stable local identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of trailing id characters appended to a local identifier
const ID_SUFFIX_LEN: usize = 4;

/// Lifecycle state reported by the workspace directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Running,
    Starting,
    Deploying,
    Stopped,
    #[default]
    Unknown,
}

impl WorkspaceStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkspaceStatus::Running)
    }
}

/// Stable, filesystem and hostname safe name for a workspace
///
/// Built from the workspace name and the tail of its id, so the same
/// workspace keeps the same identifier across runs and across reordering of
/// the directory listing. Renaming a workspace changes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceLocalId(String);

impl WorkspaceLocalId {
    pub fn from_name_and_id(name: &str, id: &str) -> Self {
        let mut cleaned = String::with_capacity(name.len());
        for c in name.chars() {
            if c.is_whitespace() {
                cleaned.push('-');
            } else if c.is_ascii_alphanumeric() || c == '-' {
                cleaned.push(c);
            }
        }
        let cleaned = cleaned.trim_matches('-');

        let suffix_start = id
            .char_indices()
            .rev()
            .nth(ID_SUFFIX_LEN - 1)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let suffix = &id[suffix_start..];

        match (cleaned.is_empty(), suffix.is_empty()) {
            (true, _) => Self(suffix.to_string()),
            (false, true) => Self(cleaned.to_string()),
            (false, false) => Self(format!("{}-{}", cleaned, suffix)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceLocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkspaceLocalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A remote workspace a tunnel can be opened to
///
/// Supplied once by the directory and treated as immutable for the rest of
/// the run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceTarget {
    /// Directory id of the workspace
    pub id: String,
    /// Human readable workspace name
    pub name: String,
    /// Network address, `host` or `host:port`
    pub address: String,
    /// Status at listing time
    #[serde(default)]
    pub status: WorkspaceStatus,
}

impl WorkspaceTarget {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            status: WorkspaceStatus::Running,
        }
    }

    pub fn with_status(mut self, status: WorkspaceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn local_id(&self) -> WorkspaceLocalId {
        WorkspaceLocalId::from_name_and_id(&self.name, &self.id)
    }

    /// Address of the workspace's SSH service
    ///
    /// An address that already carries a port is returned unchanged,
    /// otherwise `remote_port` is appended.
    pub fn ssh_address(&self, remote_port: u16) -> String {
        if has_port(&self.address) {
            self.address.clone()
        } else if self.address.contains(':') {
            format!("[{}]:{}", self.address, remote_port)
        } else {
            format!("{}:{}", self.address, remote_port)
        }
    }
}

fn has_port(address: &str) -> bool {
    if let Some(rest) = address.strip_prefix('[') {
        return rest
            .split_once("]:")
            .map(|(_, port)| port.parse::<u16>().is_ok())
            .unwrap_or(false);
    }
    match address.rsplit_once(':') {
        // A bare IPv6 address has more than one colon and no brackets
        Some((host, port)) => !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}
