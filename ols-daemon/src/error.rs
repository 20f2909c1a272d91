use std::path::PathBuf;

use thiserror::Error;

/// Error surface for daemon bootstrap and task supervision.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ols_core::ConfigError),

    #[error("mirror error: {0}")]
    Mirror(#[from] ols_mirror::MirrorError),

    #[error("development directory {path} does not exist")]
    DevDirMissing { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{task} task failed: {details}")]
    Join { task: &'static str, details: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
