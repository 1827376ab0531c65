//! Error taxonomy shared by both ends of the wire.

use crate::message::MessageType;
use thiserror::Error;

/// Failures of the byte channel itself.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected EOF on channel (plug-in crashed?)")]
    UnexpectedEof,
    #[error("wire buffer full: {requested} bytes requested, {available} available")]
    BufferFull { requested: usize, available: usize },
    #[error("channel is closed")]
    Closed,
}

/// The peer sent bytes that do not form a valid conversation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("unknown parameter type {0}")]
    UnknownParamType(u32),
    #[error("unknown procedure type {0}")]
    InvalidProcKind(u32),
    #[error("expected {expected} message, received {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: MessageType,
    },
    #[error("input ended in the middle of a value")]
    Truncated,
    #[error("array parameter {index} is not preceded by an Int32 element count")]
    MissingArrayCount { index: usize },
    #[error("array parameter {index} declares {declared} elements but holds {actual}")]
    ArrayCountMismatch {
        index: usize,
        declared: i32,
        actual: usize,
    },
    #[error("the End marker cannot be sent as a parameter value")]
    EndMarker,
    #[error("invalid float encoding {0:?}")]
    InvalidFloat(String),
    #[error("string is not valid UTF-8")]
    InvalidString,
    #[error("{what} of {len} exceeds the limit of {max}")]
    Oversized {
        what: &'static str,
        len: usize,
        max: usize,
    },
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("tile reply does not match request: {field} expected {expected}, got {actual}")]
    TileMismatch {
        field: &'static str,
        expected: i64,
        actual: i64,
    },
    #[error("tile data holds {actual} bytes, header describes {expected}")]
    TileSizeMismatch { expected: usize, actual: usize },
    #[error("no drawable with id {0}")]
    InvalidDrawable(i32),
    #[error("tile {tile_num} is outside drawable {drawable_id}")]
    InvalidTile { drawable_id: i32, tile_num: u32 },
    #[error("shared memory segment {0} is not available")]
    ShmUnavailable(i32),
}

/// Anything that can go wrong encoding, decoding or moving a message.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl WireError {
    /// True when the peer went away, as opposed to misbehaving.
    pub fn is_eof(&self) -> bool {
        matches!(
            self,
            WireError::Transport(TransportError::UnexpectedEof | TransportError::Closed)
        )
    }
}
