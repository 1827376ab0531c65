//! Wire protocol spoken between the pixwire host and its plug-ins.
//!
//! This crate provides:
//! - The parameter codec for the typed value union ([`param`])
//! - Message framing for the twelve message kinds ([`message`])
//! - Pipe and in-process shared-buffer transports ([`transport`])
//! - Shared memory segments for tile pixels ([`shm`])
//! - Tile grid geometry used by both sides ([`grid`])
//!
//! # Framing
//!
//! Every message starts with a big-endian `u32` type tag:
//!
//! ```text
//! 1 QUIT  2 CONFIG  3 TILE_REQ  4 TILE_ACK  5 TILE_DATA  6 PROC_RUN
//! 7 PROC_RETURN  8 TEMP_PROC_RUN  9 TEMP_PROC_RETURN  10 PROC_INSTALL
//! 11 PROC_UNINSTALL  12 EXTENSION_ACK
//! ```
//!
//! Integers are big-endian, strings are `u32` length (terminator included,
//! 0 for null) followed by the bytes, and floats travel as `"%0.50e"` text.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pixwire_wire::{read_message, send_message, MessageRef, SharedWireBuffer};
//!
//! let (mut host, mut plugin) = SharedWireBuffer::pair(64 * 1024);
//! send_message(&mut host, MessageRef::Quit)?;
//! let message = read_message(&mut plugin)?;
//! ```

pub mod error;
pub mod grid;
pub mod message;
pub mod param;
pub mod shm;
pub mod transport;

pub use error::{ProtocolError, TransportError, WireError};
pub use grid::{TileGrid, TileRect};
pub use message::{
    decode_message, encode_message, read_message, send_message, write_message, Config, Message,
    MessageRef, MessageType, ProcCall, ProcCallRef, ProcInstall, ProcKind, TileData, TileHeader,
    TileReq, PROTOCOL_VERSION,
};
pub use param::{
    array_rule_violation, decode, encode, ByteReader, Param, ParamDef, ParamList, ParamRef,
    ParamType, PdbStatus, Rgb, RunMode, WireRead,
};
pub use shm::SharedSegment;
pub use transport::{
    MemoryTransport, PipeTransport, SharedWireBuffer, Transport, DEFAULT_SHARED_BUFFER_SIZE,
    DEFAULT_STAGING_SIZE,
};
