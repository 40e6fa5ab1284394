//! Transaction bookkeeping.
//!
//! A transaction remembers which lines it locked and, for every line it wrote, the state
//! the line had before the first write so a rollback can restore it.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::line::{Line, LineFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Pre-image of a line written inside a transaction.
#[derive(Debug, Clone)]
pub struct RollbackEntry {
    pub version: u64,
    pub modified: bool,
    pub deleted: bool,
    pub data: Option<Bytes>,
}

#[derive(Default)]
struct TxnState {
    locks: Vec<(i64, LockMode)>,
    rollback: HashMap<i64, RollbackEntry>,
    finished: bool,
}

struct TxnInner {
    id: u64,
    rollback_enabled: bool,
    state: Mutex<TxnState>,
}

/// Handle to an open transaction. Cheap to clone; all clones share the same log.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(id: u64, rollback_enabled: bool) -> Self {
        Self {
            inner: Arc::new(TxnInner {
                id,
                rollback_enabled,
                state: Mutex::new(TxnState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().finished
    }

    /// The lock this transaction holds on `line`, if any.
    pub fn holds(&self, line: i64) -> Option<LockMode> {
        self.inner
            .state
            .lock()
            .locks
            .iter()
            .find(|(id, _)| *id == line)
            .map(|(_, mode)| *mode)
    }

    pub(crate) fn record_lock(&self, line: i64, mode: LockMode) {
        let mut state = self.inner.state.lock();
        match state.locks.iter_mut().find(|(id, _)| *id == line) {
            Some(entry) => {
                if mode == LockMode::Exclusive {
                    entry.1 = mode;
                }
            }
            None => state.locks.push((line, mode)),
        }
    }

    /// Saves the line's pre-image unless one was already taken.
    pub(crate) fn snapshot(&self, line: &Line) {
        if !self.inner.rollback_enabled {
            return;
        }
        self.inner
            .state
            .lock()
            .rollback
            .entry(line.id)
            .or_insert_with(|| RollbackEntry {
                version: line.version,
                modified: line.is(LineFlags::MODIFIED),
                deleted: line.is(LineFlags::DELETED),
                data: line.data.clone(),
            });
    }

    /// Closes the transaction, handing back its locks and rollback log.
    pub(crate) fn finish(&self) -> Option<(Vec<(i64, LockMode)>, HashMap<i64, RollbackEntry>)> {
        let mut state = self.inner.state.lock();
        if state.finished {
            return None;
        }
        state.finished = true;
        Some((
            std::mem::take(&mut state.locks),
            std::mem::take(&mut state.rollback),
        ))
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("locks", &state.locks.len())
            .field("finished", &state.finished)
            .finish()
    }
}
