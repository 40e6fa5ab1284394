use bitflags::bitflags;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::listener::CacheListener;
use crate::cluster::types::NodeId;

/// Coherence state of a line. The derived order is the privilege order `I < S < O < E`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LineState {
    Invalid = 0,
    Shared = 1,
    /// Dirty and shared with other nodes; this node grants access.
    Owned = 2,
    /// Sole copy; this node may write.
    Exclusive = 3,
}

impl LineState {
    pub fn is_owner(self) -> bool {
        self >= LineState::Owned
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LineFlags: u8 {
        /// Written locally and not yet acknowledged by the backup targets.
        const MODIFIED = 0x01;
        /// The standby replica holds this version or a newer one.
        const SLAVE = 0x02;
        /// Logical tombstone.
        const DELETED = 0x04;
        /// Ownership arrived but INVACKs from the previous sharers are outstanding.
        const INCOMPLETE = 0x08;
        /// An INV arrived while a GET was outstanding; only the new owner's PUT counts.
        const STALE_FETCH = 0x10;
    }
}

/// Transaction lock held on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// Read locks taken by GETS, counted.
    Shared(u32),
    /// Write lock owned by one transaction.
    Exclusive(u64),
}

/// The unit of coherence: one object's payload plus its protocol state.
///
/// Every field is mutated only while the line's mutex is held.
pub struct Line {
    pub id: i64,
    pub state: LineState,
    /// Outstanding transition request; coalesces duplicate GET/GETX sends.
    pub next_state: Option<LineState>,
    pub version: u64,
    pub data: Option<Bytes>,
    pub owner: NodeId,
    /// Nodes holding shared copies. Only populated while this node is the owner.
    pub sharers: BTreeSet<NodeId>,
    pub flags: LineFlags,
    pub lock: LockState,
    /// CLOCK reference bit for shared-pool eviction.
    pub referenced: bool,
    /// The owner's logical clock when this copy was last refreshed or invalidated.
    pub owner_clock: u64,
    pub invalidated_at: Option<Instant>,
    pub listener: Option<Arc<dyn CacheListener>>,
}

impl Line {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            state: LineState::Invalid,
            next_state: None,
            version: 0,
            data: None,
            owner: NodeId::NONE,
            sharers: BTreeSet::new(),
            flags: LineFlags::empty(),
            lock: LockState::Unlocked,
            referenced: true,
            owner_clock: 0,
            invalidated_at: None,
            listener: None,
        }
    }

    /// A freshly allocated line owned exclusively by `me`.
    pub fn allocated(id: i64, me: NodeId, data: Option<Bytes>) -> Self {
        let mut line = Self::new(id);
        line.state = LineState::Exclusive;
        line.owner = me;
        line.data = data;
        line.flags = LineFlags::MODIFIED;
        line
    }

    pub fn is(&self, flag: LineFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn set(&mut self, flag: LineFlags, on: bool) {
        self.flags.set(flag, on);
    }

    pub fn is_locked(&self) -> bool {
        self.lock != LockState::Unlocked
    }

    pub fn is_locked_exclusive(&self) -> bool {
        matches!(self.lock, LockState::Exclusive(_))
    }

    /// Locked by anyone other than `txn` (or locked at all when `txn` is `None`).
    pub fn is_write_locked_by_other(&self, txn: Option<u64>) -> bool {
        match self.lock {
            LockState::Exclusive(holder) => Some(holder) != txn,
            _ => false,
        }
    }

    pub fn lock_shared(&mut self) {
        self.lock = match self.lock {
            LockState::Unlocked => LockState::Shared(1),
            LockState::Shared(n) => LockState::Shared(n + 1),
            held @ LockState::Exclusive(_) => held,
        };
    }

    pub fn lock_exclusive(&mut self, txn: u64) {
        self.lock = LockState::Exclusive(txn);
    }

    pub fn unlock_shared(&mut self) {
        self.lock = match self.lock {
            LockState::Shared(n) if n > 1 => LockState::Shared(n - 1),
            LockState::Shared(_) => LockState::Unlocked,
            other => other,
        };
    }

    pub fn unlock_exclusive(&mut self, txn: u64) {
        if self.lock == LockState::Exclusive(txn) {
            self.lock = LockState::Unlocked;
        }
    }

    pub fn touch(&mut self) {
        self.referenced = true;
    }

    /// Moves to `state`, clearing the next-state marker once it is reached.
    pub fn transition(&mut self, state: LineState) {
        self.state = state;
        if !state.is_owner() {
            self.sharers.clear();
            self.flags.remove(LineFlags::INCOMPLETE);
        }
        if let Some(next) = self.next_state
            && state >= next
        {
            self.next_state = None;
        }
    }

    pub fn snapshot(&self) -> LineSnapshot {
        LineSnapshot {
            id: self.id,
            state: self.state,
            next_state: self.next_state,
            version: self.version,
            data: self.data.clone(),
            owner: self.owner,
            sharers: self.sharers.iter().copied().collect(),
            modified: self.is(LineFlags::MODIFIED),
            slave: self.is(LineFlags::SLAVE),
            deleted: self.is(LineFlags::DELETED),
            incomplete: self.is(LineFlags::INCOMPLETE),
            locked: self.is_locked(),
        }
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("id", &format_args!("{:#x}", self.id))
            .field("state", &self.state)
            .field("next_state", &self.next_state)
            .field("version", &self.version)
            .field("owner", &self.owner)
            .field("sharers", &self.sharers)
            .field("flags", &self.flags)
            .field("lock", &self.lock)
            .field("len", &self.data.as_ref().map(|d| d.len()))
            .finish()
    }
}

/// Point-in-time copy of a line for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct LineSnapshot {
    pub id: i64,
    pub state: LineState,
    pub next_state: Option<LineState>,
    pub version: u64,
    pub data: Option<Bytes>,
    pub owner: NodeId,
    pub sharers: Vec<NodeId>,
    pub modified: bool,
    pub slave: bool,
    pub deleted: bool,
    pub incomplete: bool,
    pub locked: bool,
}
