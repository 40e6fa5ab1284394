//! Coherence Engine
//!
//! The engine owns every line this node knows about and drives the protocol for it:
//! local operations run against a line under its mutex and either complete at once or
//! park until the protocol moves the line forward; inbound messages are handled under
//! the same mutex, or held in a per-line queue until the line is in a state that can
//! answer them.
//!
//! ## Execution context
//! Every entry point (an operation, an inbound message, a membership event, a backup
//! flush) works through a [`Ctx`]. Outbound messages, locally synthesized replies and
//! listener events are queued there and only drained once no line lock is held, so a
//! transport that delivers synchronously, or a listener that calls back into the store,
//! never re-enters a locked line.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::ArcMutexGuard;
use parking_lot::RawMutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use super::line::{Line, LineFlags, LineSnapshot, LineState};
use super::listener::{CacheListener, ErrorSink, EventDispatcher, LineEvent, TracingErrorSink};
use super::op::{DispatchScope, Op, OpFuture, OpKind, OpValue, PendingOp};
use super::storage::{CacheStorage, HeapStorage};
use super::store::LineStore;
use super::transaction::{LockMode, Transaction};
use crate::alloc::allocator::{Allocation, IdAllocator};
use crate::alloc::refs::{CounterRefAllocator, RefAllocationListener, RefAllocator};
use crate::backup::engine::BackupEngine;
use crate::cluster::types::{Cluster, Comm, MessageReceiver, NodeId};
use crate::config::GridConfig;
use crate::error::{CacheError, CacheResult, CommError};
use crate::grid::registry::InvokeRegistry;
use crate::message::tracker::{PendingRequest, RequestTracker, Tracked};
use crate::message::types::{Message, MessageBody, MessageFlags};

pub(crate) type LineGuard = ArcMutexGuard<RawMutex, Line>;

/// Membership change recorded against a line that was locked when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeEvent {
    Removed(NodeId),
    Switched(NodeId),
}

/// Outcome of running an operation against its line.
pub(crate) enum OpStatus {
    Done(CacheResult<OpValue>),
    Pending,
}

pub(crate) enum Outbound {
    Peer(Message),
    Slaves(Message),
}

/// Work produced while handling one entry point.
#[derive(Default)]
pub(crate) struct Ctx {
    outbox: VecDeque<Outbound>,
    /// Locally synthesized messages, handled as if they had arrived.
    deferred: VecDeque<Message>,
    resubmit: VecDeque<PendingOp>,
    events: Vec<(Option<Arc<dyn CacheListener>>, LineEvent)>,
}

impl Ctx {
    pub fn event(&mut self, line: &Line, event: LineEvent) {
        self.events.push((line.listener.clone(), event));
    }

    pub fn defer(&mut self, msg: Message) {
        self.deferred.push_back(msg);
    }

    pub fn resubmit(&mut self, ops: impl IntoIterator<Item = PendingOp>) {
        self.resubmit.extend(ops);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub node: NodeId,
    pub owned_lines: usize,
    pub shared_lines: usize,
    pub pending_ops: usize,
    pub held_messages: usize,
    pub outstanding_requests: usize,
    pub backups_pending: usize,
    pub backup_in_flight: bool,
    pub allocated_bytes: usize,
    pub free_ids: i64,
}

pub struct EngineBuilder {
    config: GridConfig,
    cluster: Arc<dyn Cluster>,
    comm: Arc<dyn Comm>,
    refs: Arc<dyn RefAllocator>,
    storage: Arc<dyn CacheStorage>,
    functions: Arc<InvokeRegistry>,
    sink: Arc<dyn ErrorSink>,
}

impl EngineBuilder {
    pub fn ref_allocator(mut self, refs: Arc<dyn RefAllocator>) -> Self {
        self.refs = refs;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn functions(mut self, functions: Arc<InvokeRegistry>) -> Self {
        self.functions = functions;
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let config = self.config;
        Arc::new(Engine {
            lines: LineStore::new(config.max_shared_lines),
            allocator: IdAllocator::new(config.alloc_batch_size),
            backup: BackupEngine::new(config.slave_ack_warn()),
            cluster: self.cluster,
            comm: self.comm,
            refs: self.refs,
            storage: self.storage,
            functions: self.functions,
            events: EventDispatcher::new(self.sink),
            pending_ops: DashMap::new(),
            held: DashMap::new(),
            node_events: DashMap::new(),
            owner_clocks: DashMap::new(),
            tracker: RequestTracker::new(),
            next_message_id: AtomicI64::new(1),
            next_op_id: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
            config,
        })
    }
}

pub struct Engine {
    pub(crate) config: GridConfig,
    pub(crate) cluster: Arc<dyn Cluster>,
    comm: Arc<dyn Comm>,
    refs: Arc<dyn RefAllocator>,
    storage: Arc<dyn CacheStorage>,
    pub(crate) functions: Arc<InvokeRegistry>,
    events: EventDispatcher,
    pub(crate) lines: LineStore,
    pub(crate) pending_ops: DashMap<i64, VecDeque<PendingOp>>,
    /// Inbound messages waiting for their line to become able to answer, in arrival order.
    pub(crate) held: DashMap<i64, VecDeque<Message>>,
    pub(crate) node_events: DashMap<i64, Vec<NodeEvent>>,
    /// Per-owner count of invalidations received; bounds stale reads.
    pub(crate) owner_clocks: DashMap<NodeId, u64>,
    pub(crate) tracker: RequestTracker,
    pub(crate) backup: BackupEngine,
    pub(crate) allocator: IdAllocator,
    next_message_id: AtomicI64,
    next_op_id: AtomicU64,
    next_txn_id: AtomicU64,
}

impl Engine {
    pub fn builder(config: GridConfig, cluster: Arc<dyn Cluster>, comm: Arc<dyn Comm>) -> EngineBuilder {
        EngineBuilder {
            config,
            cluster,
            comm,
            refs: Arc::new(CounterRefAllocator::new()),
            storage: Arc::new(HeapStorage::new()),
            functions: InvokeRegistry::new(),
            sink: Arc::new(TracingErrorSink),
        }
    }

    pub fn me(&self) -> NodeId {
        self.cluster.my_node_id()
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.events.add_listener(listener);
    }

    pub fn begin_transaction(&self) -> Transaction {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        Transaction::new(id, self.config.rollback_enabled)
    }

    // ============================================================
    // OPERATIONS
    // ============================================================

    /// Runs an operation. The returned future completes when the line reaches a state the
    /// operation can be served from, or with the error that prevented it.
    pub fn submit(&self, mut op: Op) -> OpFuture {
        if !self.cluster.is_master() {
            return OpFuture::ready(
                op.line,
                Err(CacheError::IllegalState("node is standing by as a slave".to_string())),
            );
        }
        if op.txn.as_ref().is_some_and(|t| t.is_finished()) {
            return OpFuture::ready(
                op.line,
                Err(CacheError::IllegalState("transaction already finished".to_string())),
            );
        }
        op.id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Submitting {:?} on line {:#x}", op.kind, op.line);

        let (pending, future) = PendingOp::new(op);
        let mut ctx = Ctx::default();
        self.run_op(&mut ctx, pending);
        self.drain(&mut ctx);
        future
    }

    pub(crate) fn run_op(&self, ctx: &mut Ctx, mut pending: PendingOp) {
        if pending.op.kind.is_allocation() {
            self.run_allocation(ctx, pending);
            return;
        }
        let id = pending.op.line;
        if id < 0 {
            pending.complete(Err(CacheError::RefNotFound { line: id }));
            return;
        }
        let Some(mut line) = self.lock_line(id, true) else {
            return;
        };
        match self.handle_op(ctx, &mut line, &mut pending.op) {
            OpStatus::Done(result) => pending.complete(result),
            OpStatus::Pending => self.pending_ops.entry(id).or_default().push_back(pending),
        }
        self.after_line_change(ctx, &mut line);
    }

    /// Cancels a parked operation. Returns false if it already completed.
    pub fn cancel(&self, line_id: i64, op_id: u64) -> bool {
        let Some(mut line) = self.lock_line(line_id, false) else {
            return false;
        };
        let cancelled = self.pending_ops.get_mut(&line_id).and_then(|mut queue| {
            let position = queue.iter().position(|p| p.op.id == op_id)?;
            queue.remove(position)
        });
        let Some(pending) = cancelled else {
            return false;
        };
        pending.complete(Err(CacheError::Cancelled { line: line_id }));
        let mut ctx = Ctx::default();
        self.after_line_change(&mut ctx, &mut line);
        drop(line);
        self.drain(&mut ctx);
        true
    }

    /// Releases every lock the transaction holds. A rollback restores the pre-images of
    /// the lines it wrote.
    pub fn end_transaction(&self, txn: &Transaction, commit: bool) -> CacheResult<()> {
        let Some((locks, rollback)) = txn.finish() else {
            return Err(CacheError::IllegalState(format!(
                "transaction {} already finished",
                txn.id()
            )));
        };
        if !commit && !self.config.rollback_enabled {
            tracing::warn!("Rollback of transaction {} with rollback disabled", txn.id());
        }

        let mut ctx = Ctx::default();
        for (id, mode) in locks {
            let Some(mut line) = self.lock_line(id, false) else {
                continue;
            };
            if !commit && let Some(pre) = rollback.get(&id) {
                line.version = pre.version;
                self.replace_data(&mut line, pre.data.clone());
                line.set(LineFlags::MODIFIED, pre.modified);
                line.set(LineFlags::DELETED, pre.deleted);
                tracing::debug!("Rolled back line {:#x} to version {}", id, pre.version);
            }
            match mode {
                LockMode::Shared => line.unlock_shared(),
                LockMode::Exclusive => line.unlock_exclusive(txn.id()),
            }
            self.after_line_change(&mut ctx, &mut line);
        }
        self.drain(&mut ctx);
        Ok(())
    }

    // ============================================================
    // ALLOCATION
    // ============================================================

    fn run_allocation(&self, ctx: &mut Ctx, pending: PendingOp) {
        let (count, size) = match &pending.op.kind {
            OpKind::Put(data) => (1, data.len()),
            OpKind::Alloc(count) => (*count, 0),
            _ => (0, 0),
        };
        if size > self.config.max_item_size {
            pending.complete(Err(CacheError::ItemTooLarge {
                size,
                max: self.config.max_item_size,
            }));
            return;
        }
        if count == 0 {
            pending.complete(Err(CacheError::IllegalState(
                "allocation of zero lines".to_string(),
            )));
            return;
        }

        match self.allocator.allocate_or_park(count, pending) {
            Allocation::Granted(first, pending) => self.create_lines(first, count, pending),
            Allocation::Parked { request } => {
                if let Some(amount) = request {
                    self.request_refs(ctx, amount);
                }
            }
        }
    }

    fn create_lines(&self, first: i64, count: u32, pending: PendingOp) {
        let me = self.me();
        let data = match &pending.op.kind {
            OpKind::Put(data) => Some(self.copy_in(data)),
            _ => None,
        };
        for i in 0..i64::from(count) {
            let payload = if i == 0 { data.clone() } else { None };
            let mut line = Line::allocated(first + i, me, payload);
            if let Some(txn) = &pending.op.txn {
                line.lock_exclusive(txn.id());
                txn.record_lock(line.id, LockMode::Exclusive);
            } else {
                self.backup.enqueue(&line);
            }
            self.lines.insert_owned(line);
        }
        tracing::debug!("Allocated lines [{:#x}, {:#x})", first, first + i64::from(count));
        pending.complete(Ok(OpValue::Id(first)));
    }

    /// A configured server that is currently reachable.
    pub(crate) fn has_server(&self) -> bool {
        self.config.has_server && self.cluster.has_server()
    }

    fn request_refs(&self, ctx: &mut Ctx, amount: u32) {
        if self.has_server() {
            let count = i32::try_from(amount).unwrap_or(i32::MAX);
            self.send(ctx, Message::to(NodeId::SERVER, MessageBody::AllocRef { count }));
        } else {
            self.refs.allocate_refs(amount, self);
        }
    }

    pub(crate) fn refill_failed(&self, reason: &str) {
        tracing::warn!("Id refill failed: {}", reason);
        for pending in self.allocator.refill_failed() {
            pending.complete(Err(CacheError::IllegalState(format!(
                "id allocation failed: {}",
                reason
            ))));
        }
    }

    // ============================================================
    // LINE HELPERS
    // ============================================================

    /// Locks the live record for `id`, optionally creating an Invalid line.
    pub(crate) fn lock_line(&self, id: i64, create: bool) -> Option<LineGuard> {
        loop {
            let cell = if create {
                self.lines.get_or_create(id)
            } else {
                self.lines.get(id)?
            };
            let guard = cell.lock_arc();
            if self.lines.is_current(id, &cell) {
                return Some(guard);
            }
        }
    }

    /// Copies a caller's payload into engine-owned storage.
    pub(crate) fn copy_in(&self, data: &Bytes) -> Bytes {
        let mut buf = self.storage.allocate_storage(data.len());
        buf.extend_from_slice(data);
        buf.freeze()
    }

    pub(crate) fn replace_data(&self, line: &mut Line, data: Option<Bytes>) {
        if let Some(old) = std::mem::replace(&mut line.data, data) {
            self.storage.deallocate_storage(line.id, old);
        }
    }

    pub(crate) fn owner_clock(&self, owner: NodeId) -> u64 {
        self.owner_clocks.get(&owner).map(|c| *c).unwrap_or(0)
    }

    /// Serving an invalidated copy is allowed for a bounded time, and only while no
    /// further invalidation from the same owner has been seen.
    pub(crate) fn stale_read_ok(&self, line: &Line) -> bool {
        let Some(max) = self.config.max_stale_read() else {
            return false;
        };
        if line.state != LineState::Invalid || line.data.is_none() || line.is(LineFlags::DELETED) {
            return false;
        }
        let Some(at) = line.invalidated_at else {
            return false;
        };
        at.elapsed() <= max && self.owner_clock(line.owner) == line.owner_clock
    }

    /// Retries held messages and parked operations until neither makes progress, then
    /// files the line in the right pool and queues a backup if it is dirty. A tombstone
    /// whose deletion has been backed up is unlinked instead.
    pub(crate) fn after_line_change(&self, ctx: &mut Ctx, line: &mut LineGuard) {
        self.apply_node_events(ctx, line);
        loop {
            let messages = self.retry_held_messages(ctx, line);
            let ops = self.retry_pending_ops(ctx, line);
            if !messages && !ops {
                break;
            }
        }
        if self.is_retired_tombstone(line) {
            self.lines.remove(line.id);
            tracing::trace!("Dropped deleted line {:#x}", line.id);
            return;
        }
        let guard: &LineGuard = line;
        self.lines.relocate(guard, ArcMutexGuard::mutex(guard));
        if line.state.is_owner() && line.is(LineFlags::MODIFIED) && !line.is_locked() {
            self.backup.enqueue(line);
        }
    }

    fn is_retired_tombstone(&self, line: &Line) -> bool {
        line.is(LineFlags::DELETED)
            && !line.is(LineFlags::MODIFIED)
            && !line.is_locked()
            && !self.pending_ops.contains_key(&line.id)
            && !self.held.contains_key(&line.id)
            && !self.node_events.contains_key(&line.id)
    }

    fn retry_pending_ops(&self, ctx: &mut Ctx, line: &mut Line) -> bool {
        let Some((_, queue)) = self.pending_ops.remove(&line.id) else {
            return false;
        };
        let mut progressed = false;
        let mut still = VecDeque::new();
        for mut pending in queue {
            if pending.is_abandoned() {
                continue;
            }
            match self.handle_op(ctx, line, &mut pending.op) {
                OpStatus::Done(result) => {
                    pending.complete(result);
                    progressed = true;
                }
                OpStatus::Pending => still.push_back(pending),
            }
        }
        if !still.is_empty() {
            self.pending_ops.insert(line.id, still);
        }
        progressed
    }

    fn retry_held_messages(&self, ctx: &mut Ctx, line: &mut Line) -> bool {
        let Some((_, queue)) = self.held.remove(&line.id) else {
            return false;
        };
        let mut progressed = false;
        let mut still = VecDeque::new();
        // A sender whose earlier message is still held must not be overtaken.
        let mut blocked: HashSet<NodeId> = HashSet::new();
        for msg in queue {
            if blocked.contains(&msg.node) {
                still.push_back(msg);
                continue;
            }
            if self.handle_line_message(ctx, line, &msg) {
                progressed = true;
            } else {
                blocked.insert(msg.node);
                still.push_back(msg);
            }
        }
        if !still.is_empty() {
            self.held.insert(line.id, still);
        }
        progressed
    }

    pub(crate) fn hold(&self, line: i64, msg: Message) {
        tracing::trace!("Holding {:?} from {} on line {:#x}", msg.message_type(), msg.node, line);
        self.held.entry(line).or_default().push_back(msg);
    }

    pub(crate) fn has_held_from(&self, line: i64, node: NodeId) -> bool {
        self.held
            .get(&line)
            .is_some_and(|q| q.iter().any(|m| m.node == node))
    }

    /// Completes every parked operation on `line` that `pick` selects.
    pub(crate) fn complete_ops(
        &self,
        line: i64,
        mut pick: impl FnMut(&Op) -> bool,
        result: impl Fn(&Op) -> CacheResult<OpValue>,
    ) -> usize {
        let Some(mut queue) = self.pending_ops.get_mut(&line) else {
            return 0;
        };
        let mut completed = Vec::new();
        let mut kept = VecDeque::new();
        for pending in queue.drain(..) {
            if pick(&pending.op) {
                completed.push(pending);
            } else {
                kept.push_back(pending);
            }
        }
        *queue = kept;
        drop(queue);
        self.pending_ops.remove_if(&line, |_, q| q.is_empty());

        let count = completed.len();
        for pending in completed {
            let value = result(&pending.op);
            pending.complete(value);
        }
        count
    }

    // ============================================================
    // MESSAGING
    // ============================================================

    /// Queues a message for the transport. Requests get a fresh id and are tracked for
    /// their reply; the id is returned.
    pub(crate) fn send(&self, ctx: &mut Ctx, mut msg: Message) -> i64 {
        if !msg.is_response() {
            msg.message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        }
        let id = msg.message_id;

        if msg.is_broadcast() {
            let peers = self.cluster.peers();
            if peers.is_empty() {
                if msg.is_reply_required()
                    && let Some(line) = msg.line()
                {
                    // Nobody else to ask.
                    ctx.defer(synthesized(NodeId::NONE, id, MessageBody::NotFound { line }));
                }
                return id;
            }
            self.tracker.track(&msg, peers);
        } else {
            self.tracker.track(&msg, Vec::new());
        }
        ctx.outbox.push_back(Outbound::Peer(msg));
        id
    }

    /// Queues a message for this node's slaves.
    pub(crate) fn send_to_slaves(&self, ctx: &mut Ctx, mut msg: Message) -> i64 {
        msg.node = self.me();
        if !msg.is_response() {
            msg.message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        }
        self.tracker.track(&msg, Vec::new());
        let id = msg.message_id;
        ctx.outbox.push_back(Outbound::Slaves(msg));
        id
    }

    pub(crate) fn reply(&self, ctx: &mut Ctx, request: &Message, body: MessageBody) {
        if request.is_reply_required() {
            self.send(ctx, request.reply(body));
        }
    }

    /// Runs everything the entry point produced. Must be called with no line locked.
    pub(crate) fn drain(&self, ctx: &mut Ctx) {
        loop {
            if let Some(out) = ctx.outbox.pop_front() {
                self.transmit(ctx, out);
                continue;
            }
            if let Some(msg) = ctx.deferred.pop_front() {
                self.dispatch(ctx, msg);
                continue;
            }
            if let Some(pending) = ctx.resubmit.pop_front() {
                self.run_op(ctx, pending);
                continue;
            }
            if self.lines.over_capacity() > 0 {
                self.evict(ctx);
                if !ctx.outbox.is_empty() || !ctx.deferred.is_empty() {
                    continue;
                }
            }
            break;
        }

        for (listener, event) in ctx.events.drain(..) {
            self.events.dispatch(listener.as_ref(), &event);
        }
    }

    fn transmit(&self, ctx: &mut Ctx, out: Outbound) {
        let (msg, result, to_slaves) = match out {
            Outbound::Peer(msg) => {
                let result = self.comm.send(msg.clone());
                (msg, result, false)
            }
            Outbound::Slaves(msg) => {
                let result = self.comm.send_to_slaves(msg.clone());
                (msg, result, true)
            }
        };
        let Err(error) = result else {
            return;
        };

        self.tracker.forget(msg.message_id);
        match error {
            CommError::NodeNotFound(node) => {
                tracing::debug!("{:?} to {} undeliverable: node not found", msg.message_type(), node);
            }
            CommError::Closed => {
                tracing::warn!("{:?} to {} undeliverable: transport closed", msg.message_type(), msg.node);
            }
        }
        if msg.is_response() {
            return;
        }
        match unreachable_reply(&msg) {
            Some(reply) => ctx.defer(reply),
            None => self.undeliverable(ctx, &msg, to_slaves),
        }
    }

    /// A request that cannot be answered because its target is gone.
    pub(crate) fn undeliverable(&self, ctx: &mut Ctx, msg: &Message, to_slaves: bool) {
        match &msg.body {
            MessageBody::AllocRef { .. } => self.refill_failed("id server unreachable"),
            MessageBody::BackupPacket { packet_id, .. } => {
                self.backup.target_lost(self, ctx, *packet_id, to_slaves)
            }
            _ => {}
        }
    }

    /// Ships pending backups; driven by the node's backup loop.
    pub fn flush_backups(&self) -> bool {
        self.backup.flush(self)
    }

    /// Fails requests that waited longer than the configured timeout.
    pub fn expire_requests(&self) -> usize {
        let expired = self
            .tracker
            .expire(Instant::now(), self.config.request_timeout());
        if expired.is_empty() {
            return 0;
        }
        let count = expired.len();
        let mut ctx = Ctx::default();
        for req in expired {
            self.request_expired(&mut ctx, req);
        }
        self.drain(&mut ctx);
        count
    }

    fn request_expired(&self, ctx: &mut Ctx, req: PendingRequest) {
        let request = req.request;
        tracing::warn!(
            "{:?} #{} to {} timed out",
            request.message_type(),
            request.message_id,
            request.node
        );
        match &request.body {
            MessageBody::AllocRef { .. } => self.refill_failed("id request timed out"),
            MessageBody::BackupPacket { .. } | MessageBody::Backup(_) => {
                self.backup.request_expired(self, ctx, request)
            }
            _ => {
                if let Some(line) = request.line() {
                    ctx.defer(synthesized(
                        request.node,
                        request.message_id,
                        MessageBody::Timeout { line },
                    ));
                }
            }
        }
    }

    // ============================================================
    // EVICTION
    // ============================================================

    fn evict(&self, ctx: &mut Ctx) {
        let mut budget = self.lines.over_capacity();
        let mut scans = self.lines.shared_count() * 2;
        while budget > 0 && scans > 0 {
            scans -= 1;
            let Some((id, cell)) = self.lines.clock_next() else {
                break;
            };
            let Some(mut line) = cell.try_lock_arc() else {
                self.lines.clock_return(id);
                continue;
            };
            if line.referenced {
                line.referenced = false;
                self.lines.clock_return(id);
                continue;
            }
            if !self.is_evictable(&line) {
                self.lines.clock_return(id);
                continue;
            }
            self.lines.remove_shared(id);
            self.replace_data(&mut line, None);
            ctx.event(&line, LineEvent::Evicted { line: id });
            tracing::trace!("Evicted line {:#x}", id);
            budget -= 1;
        }
    }

    fn is_evictable(&self, line: &Line) -> bool {
        !line.state.is_owner()
            && !line.is_locked()
            && line.next_state.is_none()
            // Replicas kept by a standby slave.
            && line.owner != self.me()
            && line.listener.is_none()
            && !self.pending_ops.contains_key(&line.id)
            && !self.held.contains_key(&line.id)
            && !self.node_events.contains_key(&line.id)
    }

    // ============================================================
    // INSPECTION
    // ============================================================

    pub fn line(&self, id: i64) -> Option<LineSnapshot> {
        self.lines.get(id).map(|cell| cell.lock().snapshot())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            node: self.me(),
            owned_lines: self.lines.owned_count(),
            shared_lines: self.lines.shared_count(),
            pending_ops: self.pending_ops.iter().map(|q| q.len()).sum(),
            held_messages: self.held.iter().map(|q| q.len()).sum(),
            outstanding_requests: self.tracker.len(),
            backups_pending: self.backup.pending(),
            backup_in_flight: self.backup.in_flight(),
            allocated_bytes: self.storage.total_allocated_size(),
            free_ids: self.allocator.remaining(),
        }
    }
}

impl MessageReceiver for Engine {
    fn receive(&self, msg: Message) {
        let _dispatch = DispatchScope::enter();
        let msg = match self.tracker.on_inbound(msg) {
            Tracked::Deliver(msg) | Tracked::Exhausted(msg) => msg,
            Tracked::Drop => return,
        };
        let mut ctx = Ctx::default();
        self.dispatch(&mut ctx, msg);
        self.drain(&mut ctx);
    }
}

impl RefAllocationListener for Engine {
    fn allocator_ready(&self) {
        if let Some(amount) = self.allocator.begin_prefetch() {
            let mut ctx = Ctx::default();
            self.request_refs(&mut ctx, amount);
            self.drain(&mut ctx);
        }
    }

    fn refs_allocated(&self, start: i64, count: u32) {
        let parked = self.allocator.add_range(start, count);
        if parked.is_empty() {
            return;
        }
        let mut ctx = Ctx::default();
        ctx.resubmit(parked);
        self.drain(&mut ctx);
    }
}

/// A response built locally on behalf of `from`.
pub(crate) fn synthesized(from: NodeId, message_id: i64, body: MessageBody) -> Message {
    Message {
        node: from,
        message_id,
        flags: MessageFlags::RESPONSE,
        body,
    }
}

/// The answer an unreachable node would have given.
///
/// An invalidation counts as acknowledged; a lookup is redirected to an unknown owner so
/// the requester searches again.
pub(crate) fn unreachable_reply(request: &Message) -> Option<Message> {
    if !request.is_reply_required() {
        return None;
    }
    let line = request.line()?;
    let body = match &request.body {
        MessageBody::Inv { .. } => MessageBody::InvAck { line },
        MessageBody::Get { .. }
        | MessageBody::Getx { .. }
        | MessageBody::Invoke { .. }
        | MessageBody::Msg { .. } => MessageBody::ChngdOwnr {
            line,
            new_owner: NodeId::NONE,
            certain: false,
        },
        _ => return None,
    };
    Some(synthesized(request.node, request.message_id, body))
}
