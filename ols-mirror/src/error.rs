//! Error types for ols-mirror.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from mirror operations.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The target exists, is not empty and is not a git checkout.
    #[error("dir {path} is not empty and not a .git directory")]
    DirtyTargetDirectory { path: PathBuf },

    /// Clone or fetch could not reach the remote. Retried on the next cycle.
    #[error("network error during {operation}: {details}")]
    Network {
        operation: &'static str,
        details: String,
    },

    /// Local and remote histories diverged; the mirror is never merged.
    #[error("cannot fast-forward {branch}: {details}")]
    NonFastForward { branch: String, details: String },

    /// A ref the mirror expects is missing.
    #[error("ref not found: {reference}")]
    RefNotFound { reference: String },

    /// Any other git failure.
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MirrorError {
    /// Whether the next poll cycle may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MirrorError::Network { .. })
    }
}

/// Convenience constructor for [`MirrorError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> MirrorError {
    MirrorError::Io {
        path: path.into(),
        source,
    }
}
