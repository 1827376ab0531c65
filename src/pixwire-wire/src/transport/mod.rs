//! Byte channels between host and plug-in.
//!
//! [`PipeTransport`] runs over a pair of OS pipes (a child's stdin/stdout).
//! [`MemoryTransport`] runs over [`SharedWireBuffer`] when the plug-in is a
//! thread in the host process.

mod memory;
mod pipe;

pub use memory::{MemoryTransport, SharedWireBuffer, DEFAULT_SHARED_BUFFER_SIZE};
pub use pipe::{PipeTransport, DEFAULT_STAGING_SIZE};

use crate::error::{TransportError, WireError};
use crate::param::WireRead;

/// A duplex byte channel.
///
/// Reads block until the requested count is available or the channel is
/// known to be closed. Writes may be held back until [`Transport::flush`].
pub trait Transport: Send {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn flush(&mut self) -> Result<(), TransportError>;

    /// Releases the channel. Further writes fail and the peer sees EOF.
    fn close(&mut self);

    fn read(&mut self, count: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; count];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_exact(buf)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Adapts a transport to the decoders.
pub(crate) struct ChannelReader<'a, T: ?Sized>(pub &'a mut T);

impl<T: Transport + ?Sized> WireRead for ChannelReader<'_, T> {
    fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        self.0.read_exact(buf).map_err(WireError::from)
    }
}
