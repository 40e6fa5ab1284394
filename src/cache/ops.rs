//! Local operations against a locked line.

use bytes::Bytes;

use super::engine::{Ctx, Engine, OpStatus};
use super::line::{Line, LineFlags, LineState, LockState};
use super::listener::LineEvent;
use super::op::{Op, OpKind, OpValue};
use super::transaction::LockMode;
use crate::cluster::types::NodeId;
use crate::error::{CacheError, CacheResult};
use crate::message::types::{LineFunction, Message, MessageBody, MessageFlags};

impl Engine {
    pub(crate) fn handle_op(&self, ctx: &mut Ctx, line: &mut Line, op: &mut Op) -> OpStatus {
        match op.kind.clone() {
            OpKind::Get => self.op_get(ctx, line, op, false),
            OpKind::Gets => self.op_get(ctx, line, op, true),
            OpKind::Getx => self.op_getx(ctx, line, op),
            OpKind::Set(data) => self.op_write(ctx, line, op, Some(data)),
            OpKind::Del => self.op_write(ctx, line, op, None),
            OpKind::Send(data) => self.op_send(ctx, line, op, data),
            OpKind::Push(nodes) => self.op_push(ctx, line, &nodes),
            OpKind::Pushx(node) => self.op_pushx(ctx, line, node),
            OpKind::Invoke(function) => self.op_invoke(ctx, line, op, &function),
            OpKind::Listen(listener) => {
                line.listener = listener;
                OpStatus::Done(Ok(OpValue::None))
            }
            OpKind::Put(_) | OpKind::Alloc(_) => OpStatus::Done(Err(CacheError::IllegalState(
                "allocation routed to an existing line".to_string(),
            ))),
        }
    }

    fn op_get(&self, ctx: &mut Ctx, line: &mut Line, op: &Op, lock: bool) -> OpStatus {
        if line.is(LineFlags::DELETED) {
            return OpStatus::Done(Err(CacheError::RefNotFound { line: line.id }));
        }
        if lock && line.is_write_locked_by_other(op.txn_id()) {
            return OpStatus::Pending;
        }
        if line.state >= LineState::Shared {
            if lock
                && let Some(txn) = &op.txn
                && txn.holds(line.id).is_none()
            {
                line.lock_shared();
                txn.record_lock(line.id, LockMode::Shared);
            }
            line.touch();
            return OpStatus::Done(Ok(OpValue::Data(line.data.clone())));
        }
        if !lock && self.stale_read_ok(line) {
            tracing::trace!("Serving stale copy of line {:#x}", line.id);
            return OpStatus::Done(Ok(OpValue::Data(line.data.clone())));
        }
        self.want_shared(ctx, line, op.hint);
        OpStatus::Pending
    }

    fn op_getx(&self, ctx: &mut Ctx, line: &mut Line, op: &Op) -> OpStatus {
        if line.is(LineFlags::DELETED) {
            return OpStatus::Done(Err(CacheError::RefNotFound { line: line.id }));
        }
        if let Some(txn) = &op.txn
            && txn.holds(line.id) == Some(LockMode::Shared)
        {
            return OpStatus::Done(Err(CacheError::IllegalUpgrade { line: line.id }));
        }
        if locked_against(line, op.txn_id()) {
            return OpStatus::Pending;
        }
        if line.state == LineState::Exclusive && !line.is(LineFlags::INCOMPLETE) {
            if let Some(txn) = &op.txn {
                line.lock_exclusive(txn.id());
                txn.record_lock(line.id, LockMode::Exclusive);
            }
            line.touch();
            return OpStatus::Done(Ok(OpValue::Data(line.data.clone())));
        }
        self.want_exclusive(ctx, line, op.hint);
        OpStatus::Pending
    }

    /// SET when `data` is present, DEL otherwise.
    fn op_write(&self, ctx: &mut Ctx, line: &mut Line, op: &Op, data: Option<Bytes>) -> OpStatus {
        if let Some(bytes) = &data
            && bytes.len() > self.config.max_item_size
        {
            return OpStatus::Done(Err(CacheError::ItemTooLarge {
                size: bytes.len(),
                max: self.config.max_item_size,
            }));
        }
        if line.is(LineFlags::DELETED) {
            return OpStatus::Done(Err(CacheError::RefNotFound { line: line.id }));
        }
        if let Some(txn) = &op.txn
            && txn.holds(line.id) == Some(LockMode::Shared)
        {
            return OpStatus::Done(Err(CacheError::IllegalUpgrade { line: line.id }));
        }
        if locked_against(line, op.txn_id()) {
            return OpStatus::Pending;
        }
        if line.state != LineState::Exclusive || line.is(LineFlags::INCOMPLETE) {
            self.want_exclusive(ctx, line, op.hint);
            return OpStatus::Pending;
        }

        if let Some(txn) = &op.txn {
            txn.snapshot(line);
            line.lock_exclusive(txn.id());
            txn.record_lock(line.id, LockMode::Exclusive);
        }
        let delete = data.is_none();
        line.version += 1;
        let stored = data.map(|d| self.copy_in(&d));
        self.replace_data(line, stored);
        line.set(LineFlags::MODIFIED, true);
        line.touch();
        if delete {
            line.set(LineFlags::DELETED, true);
            ctx.event(line, LineEvent::Killed { line: line.id });
        }
        OpStatus::Done(Ok(OpValue::None))
    }

    fn op_send(&self, ctx: &mut Ctx, line: &mut Line, op: &mut Op, data: Bytes) -> OpStatus {
        if line.is(LineFlags::DELETED) {
            return OpStatus::Done(Err(CacheError::RefNotFound { line: line.id }));
        }
        if line.state.is_owner() {
            ctx.event(
                line,
                LineEvent::MessageReceived {
                    line: line.id,
                    from: self.me(),
                    data: Some(data),
                },
            );
            return OpStatus::Done(Ok(OpValue::None));
        }
        if op.awaiting.is_none() {
            let body = MessageBody::Msg {
                line: line.id,
                data: Some(data),
            };
            op.awaiting = Some(self.request_owner(ctx, line, body, op.hint));
        }
        OpStatus::Pending
    }

    fn op_push(&self, ctx: &mut Ctx, line: &mut Line, nodes: &[NodeId]) -> OpStatus {
        if !line.state.is_owner() || line.is(LineFlags::DELETED) {
            return OpStatus::Done(Ok(OpValue::None));
        }
        if line.is_locked_exclusive() {
            return OpStatus::Pending;
        }
        let me = self.me();
        for &node in nodes {
            if node == me || !node.is_peer() || line.sharers.contains(&node) {
                continue;
            }
            self.send(
                ctx,
                Message::to(
                    node,
                    MessageBody::Put {
                        line: line.id,
                        version: line.version,
                        data: line.data.clone(),
                    },
                ),
            );
            line.sharers.insert(node);
        }
        if line.state == LineState::Exclusive && !line.sharers.is_empty() {
            line.transition(LineState::Owned);
        }
        OpStatus::Done(Ok(OpValue::None))
    }

    fn op_pushx(&self, ctx: &mut Ctx, line: &mut Line, node: NodeId) -> OpStatus {
        if line.state != LineState::Exclusive || node == self.me() || !node.is_peer() {
            return OpStatus::Done(Ok(OpValue::None));
        }
        if line.is_locked()
            || line.is(LineFlags::MODIFIED)
            || line.is(LineFlags::INCOMPLETE)
            || !self.release_slave_copy(ctx, line)
        {
            return OpStatus::Pending;
        }
        self.send(
            ctx,
            Message::to(
                node,
                MessageBody::Putx {
                    line: line.id,
                    version: line.version,
                    sharers: Vec::new(),
                    data: line.data.clone(),
                },
            ),
        );
        self.give_up_ownership(ctx, line, node);
        OpStatus::Done(Ok(OpValue::None))
    }

    fn op_invoke(&self, ctx: &mut Ctx, line: &mut Line, op: &mut Op, function: &LineFunction) -> OpStatus {
        if line.is(LineFlags::DELETED) {
            return OpStatus::Done(Err(CacheError::RefNotFound { line: line.id }));
        }
        if line.state.is_owner() {
            if locked_against(line, op.txn_id()) {
                return OpStatus::Pending;
            }
            if line.state != LineState::Exclusive || line.is(LineFlags::INCOMPLETE) {
                self.want_exclusive(ctx, line, op.hint);
                if line.state != LineState::Exclusive {
                    return OpStatus::Pending;
                }
            }
            if let Some(txn) = &op.txn {
                txn.snapshot(line);
                line.lock_exclusive(txn.id());
                txn.record_lock(line.id, LockMode::Exclusive);
            }
            return OpStatus::Done(self.invoke_local(line, function));
        }
        if op.awaiting.is_none() {
            let body = MessageBody::Invoke {
                line: line.id,
                function: function.to_bytes(),
            };
            op.awaiting = Some(self.request_owner(ctx, line, body, op.hint));
        }
        OpStatus::Pending
    }

    // ============================================================
    // PROTOCOL HELPERS
    // ============================================================

    /// Runs a registered line function on the owner's exclusive copy.
    pub(crate) fn invoke_local(&self, line: &mut Line, function: &LineFunction) -> CacheResult<OpValue> {
        let outcome = self
            .functions
            .invoke(&function.name, line.data.as_ref(), &function.args)
            .map_err(|e| CacheError::Invoke(format!("{:#}", e)))?;
        if let Some(update) = outcome.update {
            if update.len() > self.config.max_item_size {
                return Err(CacheError::ItemTooLarge {
                    size: update.len(),
                    max: self.config.max_item_size,
                });
            }
            line.version += 1;
            let stored = self.copy_in(&update);
            self.replace_data(line, Some(stored));
            line.set(LineFlags::MODIFIED, true);
        }
        line.touch();
        Ok(OpValue::Invoked(outcome.result))
    }

    /// Sends a request to wherever the owner is believed to be: the known owner, else the
    /// hint, else the server, else every peer.
    pub(crate) fn request_owner(&self, ctx: &mut Ctx, line: &Line, body: MessageBody, hint: NodeId) -> i64 {
        let me = self.me();
        let known = if line.owner.is_none() || line.owner == me {
            hint
        } else {
            line.owner
        };
        let msg = if known.is_peer() && known != me {
            Message::to(known, body)
        } else if known.is_server() || self.has_server() {
            Message::to(NodeId::SERVER, body)
        } else {
            Message::broadcast(body)
        };
        self.send(ctx, msg)
    }

    pub(crate) fn want_shared(&self, ctx: &mut Ctx, line: &mut Line, hint: NodeId) {
        if line.next_state >= Some(LineState::Shared) {
            return;
        }
        line.next_state = Some(LineState::Shared);
        self.request_owner(ctx, line, MessageBody::Get { line: line.id }, hint);
    }

    /// Starts the transition to E: invalidates the sharers when this node already owns the
    /// line, otherwise asks the owner for it.
    pub(crate) fn want_exclusive(&self, ctx: &mut Ctx, line: &mut Line, hint: NodeId) {
        if line.state == LineState::Owned && line.sharers.is_empty() {
            line.transition(LineState::Exclusive);
            return;
        }
        if line.next_state >= Some(LineState::Exclusive) {
            return;
        }
        line.next_state = Some(LineState::Exclusive);
        if line.state == LineState::Owned {
            self.invalidate_sharers(ctx, line);
        } else {
            self.request_owner(ctx, line, MessageBody::Getx { line: line.id }, hint);
        }
    }

    pub(crate) fn invalidate_sharers(&self, ctx: &mut Ctx, line: &mut Line) {
        let me = self.me();
        line.set(LineFlags::INCOMPLETE, true);
        for &sharer in line.sharers.iter().filter(|s| **s != me) {
            self.send(
                ctx,
                Message::to(
                    sharer,
                    MessageBody::Inv {
                        line: line.id,
                        previous_owner: me,
                    },
                ),
            );
        }
    }

    /// Drops the standby copy before ownership leaves this node. Returns false while a
    /// backup packet holding the line is unacknowledged.
    pub(crate) fn release_slave_copy(&self, ctx: &mut Ctx, line: &mut Line) -> bool {
        if !line.is(LineFlags::SLAVE) {
            return true;
        }
        if self.backup.in_flight_contains(line.id) {
            return false;
        }
        let mut inv = Message::to(
            self.me(),
            MessageBody::Inv {
                line: line.id,
                previous_owner: self.me(),
            },
        );
        inv.flags.remove(MessageFlags::REPLY_REQUIRED);
        self.send_to_slaves(ctx, inv);
        line.set(LineFlags::SLAVE, false);
        true
    }

    /// Turns this node's copy into an Invalid line owned by `new_owner`.
    pub(crate) fn give_up_ownership(&self, ctx: &mut Ctx, line: &mut Line, new_owner: NodeId) {
        line.transition(LineState::Invalid);
        line.next_state = None;
        line.owner = new_owner;
        line.set(LineFlags::SLAVE, false);
        line.owner_clock = self.owner_clock(new_owner);
        line.invalidated_at = Some(std::time::Instant::now());
        ctx.event(line, LineEvent::Invalidated { line: line.id });
    }
}

/// Locked by a transaction other than `txn`, in any mode.
fn locked_against(line: &Line, txn: Option<u64>) -> bool {
    match line.lock {
        LockState::Unlocked => false,
        LockState::Exclusive(holder) => Some(holder) != txn,
        LockState::Shared(_) => true,
    }
}
