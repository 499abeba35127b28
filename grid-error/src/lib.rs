use std::time::SystemTimeError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GridError>;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The digest of received or stored bytes does not match the
    /// content hash they were addressed by. The artifact is discarded.
    #[error("integrity failure: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    /// The peer has no artifact under the requested hash. Normal
    /// outcome, not a failure.
    #[error("artifact not found: {0}")]
    NotFound(String),
    /// Connect, read, write or timeout failure talking to a peer.
    /// The peer is treated as unreachable for this attempt only.
    #[error("transport error: {0}")]
    Transport(String),
    /// A peer response that could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(String),
    #[error("storage error: {0} {1}")]
    Storage(String, String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for GridError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<SystemTimeError> for GridError {
    fn from(value: SystemTimeError) -> Self {
        Self::Other(anyhow::anyhow!(value.to_string()))
    }
}
