//! Peer data exchange between pipeline nodes.
//!
//! A node publishes finished task results through its [`DataServer`];
//! sibling nodes fetch them, whole or by dotted path, with [`DataRequest`].

pub mod cache;
pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use cache::DataCache;
pub use client::DataRequest;
pub use error::{DataError, Result};
pub use protocol::{DataQuery, DataReply, ErrorBody, ErrorCode, ItemReply};
pub use server::DataServer;
