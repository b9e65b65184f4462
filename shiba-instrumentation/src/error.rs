//! Error types for shiba-instrumentation.

use std::path::PathBuf;

use shiba_protocol::ChannelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("failed to load library {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("library {path} does not export {symbol}: {source}")]
    MissingSymbol {
        path: PathBuf,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server location is custom-cli but no CLI path is set")]
    MissingCustomCli,

    #[error("failed to start CLI server {path}")]
    CliStart { path: PathBuf },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Why a reconciliation pass stopped early.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("server: {0}")]
    Server(#[from] ServerError),

    #[error("failed to load library {path}")]
    LibraryLoad { path: PathBuf },

    #[error("failed to unload library")]
    LibraryUnload,
}
