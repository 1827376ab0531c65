use super::Transport;
use crate::error::TransportError;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Per-direction capacity used when none is configured.
pub const DEFAULT_SHARED_BUFFER_SIZE: usize = 2 * 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Host,
    Plugin,
}

#[derive(Debug, Default)]
struct Lanes {
    to_plugin: VecDeque<u8>,
    to_host: VecDeque<u8>,
    closed: bool,
}

impl Lanes {
    fn inbound(&mut self, side: Side) -> &mut VecDeque<u8> {
        match side {
            Side::Host => &mut self.to_host,
            Side::Plugin => &mut self.to_plugin,
        }
    }

    fn outbound(&mut self, side: Side) -> &mut VecDeque<u8> {
        match side {
            Side::Host => &mut self.to_plugin,
            Side::Plugin => &mut self.to_host,
        }
    }
}

/// Bounded buffer shared by a host and a plug-in running as threads of one
/// process. Writers never block: a write that does not fit fails with
/// `BufferFull`. Readers block until their bytes arrive or the buffer closes.
#[derive(Debug)]
pub struct SharedWireBuffer {
    capacity: usize,
    lanes: Mutex<Lanes>,
    ready: Condvar,
}

impl SharedWireBuffer {
    /// Creates a buffer and returns its host and plug-in ends.
    pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
        let shared = Arc::new(SharedWireBuffer {
            capacity: capacity.max(1),
            lanes: Mutex::new(Lanes::default()),
            ready: Condvar::new(),
        });
        let host = MemoryTransport {
            shared: shared.clone(),
            side: Side::Host,
        };
        let plugin = MemoryTransport {
            shared,
            side: Side::Plugin,
        };
        (host, plugin)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One end of a [`SharedWireBuffer`]. Dropping it closes the buffer.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<SharedWireBuffer>,
    side: Side,
}

impl MemoryTransport {
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Bytes waiting to be read by this end.
    pub fn pending(&self) -> usize {
        self.shared.lock().inbound(self.side).len()
    }
}

impl Transport for MemoryTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let wanted = buf.len();
        let mut lanes = self.shared.lock();
        loop {
            let inbound = lanes.inbound(self.side);
            if inbound.len() >= wanted {
                for (dst, byte) in buf.iter_mut().zip(inbound.drain(..wanted)) {
                    *dst = byte;
                }
                return Ok(());
            }
            if lanes.closed {
                return Err(TransportError::UnexpectedEof);
            }
            lanes = self
                .shared
                .ready
                .wait(lanes)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let capacity = self.shared.capacity;
        let mut lanes = self.shared.lock();
        if lanes.closed {
            return Err(TransportError::Closed);
        }
        let outbound = lanes.outbound(self.side);
        let available = capacity - outbound.len();
        if bytes.len() > available {
            return Err(TransportError::BufferFull {
                requested: bytes.len(),
                available,
            });
        }
        outbound.extend(bytes);
        self.shared.ready.notify_all();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.shared.ready.notify_all();
        Ok(())
    }

    fn close(&mut self) {
        let mut lanes = self.shared.lock();
        if !lanes.closed {
            lanes.closed = true;
            tracing::trace!(side = ?self.side, "shared wire buffer closed");
        }
        self.shared.ready.notify_all();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
