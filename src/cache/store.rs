//! Line pools.
//!
//! Lines this node owns (O/E) live in the `owned` pool, everything else (S/I) in the
//! `shared` pool. Only the shared pool is bounded; it is trimmed with a CLOCK sweep over
//! its insertion order. Each shared line sits on the ring at most once.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use super::line::Line;

pub type LineRef = Arc<Mutex<Line>>;

#[derive(Default)]
struct ClockRing {
    order: VecDeque<i64>,
    members: HashSet<i64>,
}

impl ClockRing {
    fn push(&mut self, id: i64) {
        if self.members.insert(id) {
            self.order.push_back(id);
        }
    }

    fn pop(&mut self) -> Option<i64> {
        let id = self.order.pop_front()?;
        self.members.remove(&id);
        Some(id)
    }

    fn forget(&mut self, id: i64) {
        if self.members.remove(&id) {
            self.order.retain(|x| *x != id);
        }
    }
}

pub struct LineStore {
    owned: DashMap<i64, LineRef>,
    shared: DashMap<i64, LineRef>,
    clock: Mutex<ClockRing>,
    capacity: usize,
}

impl LineStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            owned: DashMap::new(),
            shared: DashMap::new(),
            clock: Mutex::new(ClockRing::default()),
            capacity,
        }
    }

    pub fn get(&self, id: i64) -> Option<LineRef> {
        if let Some(cell) = self.owned.get(&id) {
            return Some(cell.value().clone());
        }
        self.shared.get(&id).map(|cell| cell.value().clone())
    }

    /// Returns the line, creating an Invalid one in the shared pool on a miss.
    pub fn get_or_create(&self, id: i64) -> LineRef {
        if let Some(cell) = self.get(id) {
            return cell;
        }
        let mut created = false;
        let cell = self
            .shared
            .entry(id)
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(Line::new(id)))
            })
            .value()
            .clone();
        if created {
            self.clock.lock().push(id);
        }
        cell
    }

    /// Inserts a line this node just allocated.
    pub fn insert_owned(&self, line: Line) -> LineRef {
        let id = line.id;
        let cell = Arc::new(Mutex::new(line));
        self.owned.insert(id, cell.clone());
        cell
    }

    /// Puts the line into the pool its state belongs to. Called with the line locked.
    ///
    /// The line is inserted into its new pool before leaving the old one, so a concurrent
    /// lookup always finds it in at least one of them.
    pub fn relocate(&self, line: &Line, cell: &LineRef) {
        let id = line.id;
        if line.state.is_owner() {
            if !self.owned.contains_key(&id) {
                self.owned.insert(id, cell.clone());
                self.shared.remove(&id);
                self.clock.lock().forget(id);
            }
        } else if !self.shared.contains_key(&id) {
            self.shared.insert(id, cell.clone());
            self.owned.remove(&id);
            self.clock.lock().push(id);
        }
    }

    /// Whether `cell` is still the live record for `id`. A cell can be unlinked (evicted)
    /// between a lookup and acquiring its lock.
    pub fn is_current(&self, id: i64, cell: &LineRef) -> bool {
        self.get(id).is_some_and(|live| Arc::ptr_eq(&live, cell))
    }

    pub fn remove_shared(&self, id: i64) -> Option<LineRef> {
        self.shared.remove(&id).map(|(_, cell)| cell)
    }

    /// Unlinks the line from whichever pool holds it. Called with the line locked.
    pub fn remove(&self, id: i64) {
        self.owned.remove(&id);
        self.shared.remove(&id);
        self.clock.lock().forget(id);
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    pub fn shared_count(&self) -> usize {
        self.shared.len()
    }

    pub fn over_capacity(&self) -> usize {
        self.shared.len().saturating_sub(self.capacity)
    }

    pub fn owned_ids(&self) -> Vec<i64> {
        self.owned.iter().map(|e| *e.key()).collect()
    }

    pub fn shared_ids(&self) -> Vec<i64> {
        self.shared.iter().map(|e| *e.key()).collect()
    }

    pub fn all_ids(&self) -> Vec<i64> {
        let mut ids = self.owned_ids();
        ids.extend(self.shared_ids());
        ids
    }

    /// Next shared line the CLOCK hand points at, or `None` when the ring is empty.
    pub fn clock_next(&self) -> Option<(i64, LineRef)> {
        let mut clock = self.clock.lock();
        for _ in 0..clock.order.len() {
            let id = clock.pop()?;
            if let Some(cell) = self.shared.get(&id) {
                return Some((id, cell.value().clone()));
            }
            // Stale ring entry: the line moved to the owned pool or was evicted.
        }
        None
    }

    /// Hands a line back to the CLOCK ring after it survived a sweep.
    pub fn clock_return(&self, id: i64) {
        self.clock.lock().push(id);
    }

    #[cfg(test)]
    pub fn clock_len(&self) -> usize {
        self.clock.lock().order.len()
    }
}
