//! Error types for shiba-protocol.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Nothing is listening yet. Expected while a server is starting up.
    #[error("connection refused by {address}")]
    Refused { address: String },

    #[error("I/O error on {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel is not connected")]
    NotConnected,

    #[error("channel is already connected to {0}")]
    AlreadyConnected(String),
}

pub(crate) fn io_err(address: impl Into<String>, source: std::io::Error) -> ChannelError {
    ChannelError::Io {
        address: address.into(),
        source,
    }
}
