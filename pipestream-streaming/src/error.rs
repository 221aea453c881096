use thiserror::Error;

use crate::wire::WireError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No producer is configured for this node")]
    NoProducer,

    #[error("No flow given and no default flow configured")]
    NoDefaultFlow,

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] pipestream_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
