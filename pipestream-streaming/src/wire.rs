//! Wire format for streaming frames.
//!
//! Frames travel over TCP inside a length-delimited envelope
//! (`tokio_util::codec::LengthDelimitedCodec`). The body of each frame is:
//!
//! `[signal:1][identity:2+N][consumer_type:2+N][flow:4+N][header:4+N][payload:4+N]`
//!
//! - **signal**: one of [`Signal`]
//! - **identity**: sender identity (listeners use a random id, producers their node name)
//! - **consumer_type**: consumer type the frame concerns
//! - **flow**: JSON encoded remaining flow pattern, zero length when absent
//! - **header** / **payload**: opaque encoded message bytes
//!
//! All lengths are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

use crate::flow::FlowPattern;

/// Largest frame accepted on the wire (256 MiB)
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Protocol signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Signal {
    Init = 0x01,
    Ready = 0x02,
    NotReady = 0x03,
    Heartbeat = 0x04,
    Msg = 0x05,
    NoMsg = 0x06,
    Done = 0x07,
    Disconnect = 0x08,
}

impl Signal {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::NotReady => "not_ready",
            Self::Heartbeat => "heartbeat",
            Self::Msg => "msg",
            Self::NoMsg => "no_msg",
            Self::Done => "done",
            Self::Disconnect => "disconnect",
        }
    }
}

impl TryFrom<u8> for Signal {
    type Error = WireError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => Self::Init,
            0x02 => Self::Ready,
            0x03 => Self::NotReady,
            0x04 => Self::Heartbeat,
            0x05 => Self::Msg,
            0x06 => Self::NoMsg,
            0x07 => Self::Done,
            0x08 => Self::Disconnect,
            other => return Err(WireError::UnknownSignal(other)),
        })
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire format error types.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Frame ended before a field was complete
    #[error("truncated frame: need {needed} bytes for {field}, have {have}")]
    Truncated {
        field: &'static str,
        needed: usize,
        have: usize,
    },

    #[error("unknown signal byte {0:#04x}")]
    UnknownSignal(u8),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("invalid flow pattern: {0}")]
    InvalidFlow(#[from] serde_json::Error),

    #[error("{field} too long: {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub signal: Signal,
    pub identity: String,
    pub consumer_type: String,
    pub flow: Option<FlowPattern>,
    pub header: Bytes,
    pub payload: Bytes,
}

impl Frame {
    /// Control frame with no flow, header or payload
    pub fn signal(
        signal: Signal,
        identity: impl Into<String>,
        consumer_type: impl Into<String>,
    ) -> Self {
        Self {
            signal,
            identity: identity.into(),
            consumer_type: consumer_type.into(),
            flow: None,
            header: Bytes::new(),
            payload: Bytes::new(),
        }
    }

    /// Message frame carrying the remaining flow
    pub fn message(
        identity: impl Into<String>,
        consumer_type: impl Into<String>,
        flow: FlowPattern,
        header: Bytes,
        payload: Bytes,
    ) -> Self {
        Self {
            signal: Signal::Msg,
            identity: identity.into(),
            consumer_type: consumer_type.into(),
            flow: Some(flow),
            header,
            payload,
        }
    }

    /// Completion frame carrying an encoded result
    pub fn done(identity: impl Into<String>, consumer_type: impl Into<String>, result: Bytes) -> Self {
        Self {
            payload: result,
            ..Self::signal(Signal::Done, identity, consumer_type)
        }
    }

    /// Serialize into a frame body (without the outer length prefix)
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let flow = match &self.flow {
            Some(flow) => serde_json::to_vec(flow)?,
            None => Vec::new(),
        };
        let mut buf = BytesMut::with_capacity(
            1 + 2 + self.identity.len()
                + 2 + self.consumer_type.len()
                + 4 + flow.len()
                + 4 + self.header.len()
                + 4 + self.payload.len(),
        );
        buf.put_u8(self.signal as u8);
        put_short(&mut buf, "identity", self.identity.as_bytes())?;
        put_short(&mut buf, "consumer_type", self.consumer_type.as_bytes())?;
        put_long(&mut buf, "flow", &flow)?;
        put_long(&mut buf, "header", &self.header)?;
        put_long(&mut buf, "payload", &self.payload)?;
        Ok(buf.freeze())
    }

    /// Parse a frame body
    pub fn decode(mut data: Bytes) -> Result<Self, WireError> {
        ensure(&data, "signal", 1)?;
        let signal = Signal::try_from(data.get_u8())?;
        let identity = take_string(&mut data, "identity")?;
        let consumer_type = take_string(&mut data, "consumer_type")?;
        let flow = take_long(&mut data, "flow")?;
        let flow = if flow.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&flow)?)
        };
        let header = take_long(&mut data, "header")?;
        let payload = take_long(&mut data, "payload")?;
        Ok(Self {
            signal,
            identity,
            consumer_type,
            flow,
            header,
            payload,
        })
    }
}

/// Length-delimited codec used by both ends of a streaming connection
#[must_use]
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

fn ensure(data: &Bytes, field: &'static str, needed: usize) -> Result<(), WireError> {
    if data.remaining() < needed {
        return Err(WireError::Truncated {
            field,
            needed,
            have: data.remaining(),
        });
    }
    Ok(())
}

fn put_short(buf: &mut BytesMut, field: &'static str, value: &[u8]) -> Result<(), WireError> {
    let len = u16::try_from(value.len()).map_err(|_| WireError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

fn put_long(buf: &mut BytesMut, field: &'static str, value: &[u8]) -> Result<(), WireError> {
    let len = u32::try_from(value.len()).map_err(|_| WireError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

fn take_string(data: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    ensure(data, field, 2)?;
    let len = data.get_u16() as usize;
    ensure(data, field, len)?;
    let raw = data.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
}

fn take_long(data: &mut Bytes, field: &'static str) -> Result<Bytes, WireError> {
    ensure(data, field, 4)?;
    let len = data.get_u32() as usize;
    ensure(data, field, len)?;
    Ok(data.split_to(len))
}
