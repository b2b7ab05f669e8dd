use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the on-disk stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to get home directory")]
    HomeDir,

    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid port {0}")]
    InvalidPort(u16),

    #[error("'{0}' not found")]
    NotFound(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.into(),
            source,
        }
    }
}
