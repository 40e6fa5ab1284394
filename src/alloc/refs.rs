use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Receives id ranges from a [`RefAllocator`].
pub trait RefAllocationListener {
    /// The allocator can now serve requests; a good moment to prefetch.
    fn allocator_ready(&self);

    fn refs_allocated(&self, start: i64, count: u32);
}

/// Cluster-wide id source used when no central server hands out ranges.
pub trait RefAllocator: Send + Sync {
    /// Asks for `count` ids. The range arrives through `listener`, possibly before this
    /// call returns.
    fn allocate_refs(&self, count: u32, listener: &dyn RefAllocationListener);
}

/// Hands out ranges from a counter. Clones share the counter, so every node built from
/// the same instance draws from one id space.
#[derive(Clone)]
pub struct CounterRefAllocator {
    next: Arc<AtomicI64>,
}

impl CounterRefAllocator {
    /// First id handed out. Line ids below it are left for well-known roots.
    pub const FIRST_ID: i64 = 0x1_0000;

    pub fn new() -> Self {
        Self::starting_at(Self::FIRST_ID)
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: Arc::new(AtomicI64::new(first)),
        }
    }
}

impl Default for CounterRefAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefAllocator for CounterRefAllocator {
    fn allocate_refs(&self, count: u32, listener: &dyn RefAllocationListener) {
        let start = self.next.fetch_add(i64::from(count), Ordering::SeqCst);
        tracing::debug!("Allocated ids [{}, {})", start, start + i64::from(count));
        listener.refs_allocated(start, count);
    }
}
