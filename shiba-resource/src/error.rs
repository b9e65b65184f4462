//! Error types for shiba-resource.

use std::path::PathBuf;

use thiserror::Error;

/// Error returned by [`ResourceHooks`](crate::ResourceHooks) callbacks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source file does not exist: {path}")]
    MissingSource { path: PathBuf },

    #[error("path has no file name: {path}")]
    NoFileName { path: PathBuf },

    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process already running (pid {0})")]
    AlreadyRunning(u32),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ResourceError {
    ResourceError::Io {
        path: path.into(),
        source,
    }
}
