//! Payload storage.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Allocates the buffers line payloads are kept in and accounts for them.
pub trait CacheStorage: Send + Sync {
    fn allocate_storage(&self, size: usize) -> BytesMut;

    /// Returns a payload that a line no longer holds.
    fn deallocate_storage(&self, line: i64, buffer: Bytes);

    fn total_allocated_size(&self) -> usize;
}

/// Plain heap buffers with a running byte count.
#[derive(Default)]
pub struct HeapStorage {
    allocated: AtomicUsize,
}

impl HeapStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for HeapStorage {
    fn allocate_storage(&self, size: usize) -> BytesMut {
        self.allocated.fetch_add(size, Ordering::Relaxed);
        BytesMut::with_capacity(size)
    }

    fn deallocate_storage(&self, line: i64, buffer: Bytes) {
        let size = buffer.len();
        let _ = self
            .allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(size))
            });
        tracing::trace!("Released {} bytes of line {:#x}", size, line);
    }

    fn total_allocated_size(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}
