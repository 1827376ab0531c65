//! Shared memory segments for tile transfer between threads of one process.

use crate::error::ProtocolError;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_SEGMENT_ID: AtomicI32 = AtomicI32::new(1);

/// A byte segment both ends can reach, identified on the wire by its id.
#[derive(Debug, Clone)]
pub struct SharedSegment {
    id: i32,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedSegment {
    /// Allocates a zeroed segment with a fresh id.
    pub fn allocate(size: usize) -> Self {
        Self {
            id: NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed),
            bytes: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `data` to the start of the segment.
    pub fn store(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let max = bytes.len();
        let target = bytes.get_mut(..data.len()).ok_or(ProtocolError::Oversized {
            what: "shared memory tile",
            len: data.len(),
            max,
        })?;
        target.copy_from_slice(data);
        Ok(())
    }

    /// Fills `out` from the start of the segment.
    pub fn load(&self, out: &mut [u8]) -> Result<(), ProtocolError> {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let source = bytes.get(..out.len()).ok_or(ProtocolError::Oversized {
            what: "shared memory tile",
            len: out.len(),
            max: bytes.len(),
        })?;
        out.copy_from_slice(source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_bytes() {
        let segment = SharedSegment::allocate(16);
        let peer = segment.clone();
        segment.store(&[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        peer.load(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(peer.id(), segment.id());
    }

    #[test]
    fn ids_are_unique_and_bounds_are_checked() {
        let a = SharedSegment::allocate(4);
        let b = SharedSegment::allocate(4);
        assert_ne!(a.id(), b.id());
        assert!(a.store(&[0; 5]).is_err());
        assert!(a.load(&mut [0; 5]).is_err());
    }
}
