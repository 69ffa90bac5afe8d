//! Error taxonomy for the mirroring core.
//!
//! Every fallible seam in this crate returns [`MirrorError`] (or wraps one
//! behind `anyhow::Error` at orchestration boundaries, the way `main.rs`
//! and the phase drivers do). The variants mirror the error *kinds* from
//! the design: callers match on kind, not on message text.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("path {path:?} is unsafe: {reason}")]
    Path { path: PathBuf, reason: PathReason },

    #[error("another run holds the lock at {0:?}")]
    Locked(PathBuf),

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("checksum mismatch for {path}: {reason}")]
    Checksum { path: String, reason: String },

    #[error("PGP verification failed: {0}")]
    Pgp(String),

    #[error("{path} not found (404)")]
    NotFound { path: String },

    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathReason {
    AbsolutePath,
    DirectoryTraversal,
    OutsideRoot,
}

impl std::fmt::Display for PathReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PathReason::AbsolutePath => "absolute path is not allowed",
            PathReason::DirectoryTraversal => "directory traversal",
            PathReason::OutsideRoot => "resolves outside the allowed root",
        };
        f.write_str(s)
    }
}

impl MirrorError {
    pub fn path(path: impl Into<PathBuf>, reason: PathReason) -> Self {
        MirrorError::Path {
            path: path.into(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
