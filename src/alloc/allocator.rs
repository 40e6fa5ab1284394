//! Local id range.
//!
//! Ids are handed out from a `[next, end)` window. When the window cannot serve a request
//! the operation is parked and a refill of `max(2 * count, batch)` ids is requested once;
//! parked operations are resubmitted when the refill lands.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::cache::op::PendingOp;

struct Window {
    next: i64,
    end: i64,
    requesting: bool,
    parked: VecDeque<PendingOp>,
}

pub(crate) enum Allocation {
    Granted(i64, PendingOp),
    /// Parked; `request` carries the refill size when this call should ask for one.
    Parked { request: Option<u32> },
}

pub struct IdAllocator {
    window: Mutex<Window>,
    batch: u32,
}

impl IdAllocator {
    pub fn new(batch: u32) -> Self {
        Self {
            window: Mutex::new(Window {
                next: 0,
                end: 0,
                requesting: false,
                parked: VecDeque::new(),
            }),
            batch: batch.max(1),
        }
    }

    /// Reserves `count` consecutive ids, returning the first, or -1 if the window is short.
    pub fn allocate(&self, count: u32) -> i64 {
        let mut window = self.window.lock();
        take(&mut window, count).unwrap_or(-1)
    }

    pub(crate) fn allocate_or_park(&self, count: u32, pending: PendingOp) -> Allocation {
        let mut window = self.window.lock();
        if let Some(first) = take(&mut window, count) {
            return Allocation::Granted(first, pending);
        }
        window.parked.push_back(pending);
        if window.requesting {
            return Allocation::Parked { request: None };
        }
        window.requesting = true;
        Allocation::Parked {
            request: Some(self.refill_size(count)),
        }
    }

    /// Claims the right to prefetch a batch when the window is empty and nobody asked yet.
    pub(crate) fn begin_prefetch(&self) -> Option<u32> {
        let mut window = self.window.lock();
        if window.requesting || window.next < window.end {
            return None;
        }
        window.requesting = true;
        Some(self.batch)
    }

    /// Installs a refill and hands back the operations waiting for it.
    pub(crate) fn add_range(&self, start: i64, count: u32) -> Vec<PendingOp> {
        let mut window = self.window.lock();
        if start == window.end {
            window.end += i64::from(count);
        } else {
            if window.next < window.end {
                tracing::debug!(
                    "Discarding {} ids left in [{}, {})",
                    window.end - window.next,
                    window.next,
                    window.end
                );
            }
            window.next = start;
            window.end = start + i64::from(count);
        }
        window.requesting = false;
        tracing::debug!("Id window now [{}, {})", window.next, window.end);
        window.parked.drain(..).collect()
    }

    /// The refill request failed; returns the parked operations so they can be failed.
    pub(crate) fn refill_failed(&self) -> Vec<PendingOp> {
        let mut window = self.window.lock();
        window.requesting = false;
        window.parked.drain(..).collect()
    }

    pub fn remaining(&self) -> i64 {
        let window = self.window.lock();
        window.end - window.next
    }

    pub fn parked(&self) -> usize {
        self.window.lock().parked.len()
    }

    pub fn refill_size(&self, count: u32) -> u32 {
        count.saturating_mul(2).max(self.batch)
    }
}

fn take(window: &mut Window, count: u32) -> Option<i64> {
    let count = i64::from(count);
    if window.end - window.next < count {
        return None;
    }
    let first = window.next;
    window.next += count;
    Some(first)
}
