use std::time::Duration;
use thiserror::Error;

use crate::protocol::ErrorCode;

#[derive(Error, Debug)]
pub enum DataError {
    /// Peer could not be reached within the ping timeout
    #[error("Server {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    /// Peer accepted the request but did not answer in time
    #[error("Request to {address} timed out after {timeout:?}")]
    RequestTimeout { address: String, timeout: Duration },

    #[error("Server error {code}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] pipestream_core::Error),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, DataError>;
