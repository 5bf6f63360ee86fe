use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("login to the genome portal failed: {0}")]
    #[diagnostic(help("check your username and password and try again"))]
    Auth(String),

    #[error("missing portal credentials (username and password are required to fetch)")]
    MissingCredentials,

    #[error("invalid username (expected an e-mail address): {0}")]
    InvalidUsername(String),

    #[error("portal request failed: {0}")]
    Network(String),

    #[error("portal returned status {status}: {message}")]
    PortalStatus { status: u16, message: String },

    #[error("invalid resource url: {0}")]
    InvalidUrl(String),

    #[error("invalid md5 checksum: {0}")]
    InvalidChecksum(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("giving up on {url} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("directory {path} is not creatable or writable: {message}")]
    Permission { path: PathBuf, message: String },

    #[error("conversion of {file} exited with code {code}")]
    Conversion { file: String, code: i32 },

    #[error("interrupted")]
    Cancelled,

    #[error("config file not found: {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
}

impl SyncError {
    /// Errors a single entry's download loop may recover from by trying again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::ChecksumMismatch { .. } => true,
            SyncError::PortalStatus { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }
}
