pub mod bootstrap;
pub mod config;
pub mod encoding;
pub mod error;
pub mod logging;
pub mod path;

pub use config::Config;
pub use encoding::{Encoding, EncodingKind, JsonEncoding};
pub use error::{Error, Result};
pub use path::{Lookup, Path, PathSegment};
