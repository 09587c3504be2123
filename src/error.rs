//! Error types shared by every Valet manager.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Valet operations.
pub type ValetResult<T> = Result<T, ValetError>;

/// Errors that can occur while driving certificates, site configs and pools.
#[derive(Debug, Error)]
pub enum ValetError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("command `{command}` exited with code {code}: {stderr}")]
    Process {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate authority error: {0}")]
    CertificateAuthority(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unable to install PHP {version}: {reason}")]
    VersionInstall { version: String, reason: String },

    #[error("invalid PHP version: {0}")]
    InvalidVersion(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ValetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
