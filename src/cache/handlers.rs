//! Inbound protocol messages.
//!
//! Line messages are handled under the line's mutex. A handler returns `false` when the
//! line cannot answer yet; the message is then held and retried after the next change to
//! the line.

use super::engine::{Ctx, Engine};
use super::line::{Line, LineFlags, LineState};
use super::listener::LineEvent;
use super::op::{OpKind, OpValue};
use crate::cluster::types::NodeId;
use crate::error::CacheError;
use crate::message::types::{LineFunction, Message, MessageBody, MessageType};

impl Engine {
    pub(crate) fn dispatch(&self, ctx: &mut Ctx, msg: Message) {
        tracing::trace!(
            "{:?} #{} from {} (line {:?})",
            msg.message_type(),
            msg.message_id,
            msg.node,
            msg.line()
        );
        match &msg.body {
            MessageBody::Backup(_) | MessageBody::BackupPacket { .. } => {
                self.backup.receive(self, ctx, &msg)
            }
            MessageBody::BackupAck { .. } | MessageBody::BackupPacketAck { .. } => {
                self.backup.on_ack(self, ctx, &msg)
            }
            MessageBody::AllocRef { .. } => {
                tracing::warn!("Ignoring ALLOC_REF from {}: only the server hands out ids", msg.node);
            }
            MessageBody::AllocedRef { start, count } => {
                let count = u32::try_from(*count).unwrap_or(0);
                ctx.resubmit(self.allocator.add_range(*start, count));
            }
            MessageBody::Ack => {}
            _ => self.on_line_message(ctx, msg),
        }
    }

    fn on_line_message(&self, ctx: &mut Ctx, msg: Message) {
        let Some(id) = msg.line() else {
            return;
        };
        let create = matches!(msg.body, MessageBody::Put { .. } | MessageBody::Putx { .. });
        let Some(mut line) = self.lock_line(id, create) else {
            self.on_unknown_line(ctx, &msg);
            return;
        };

        // An owner answers a broadcast lookup by naming itself; the requester follows up
        // with a unicast.
        if msg.is_broadcast() && line.state.is_owner() && is_lookup(msg.message_type()) {
            self.reply(
                ctx,
                &msg,
                MessageBody::ChngdOwnr {
                    line: id,
                    new_owner: self.me(),
                    certain: true,
                },
            );
            return;
        }

        if self.has_held_from(id, msg.node) {
            self.hold(id, msg);
            return;
        }
        if !self.handle_line_message(ctx, &mut line, &msg) {
            self.hold(id, msg);
        }
        self.after_line_change(ctx, &mut line);
    }

    /// Answers for a line this node has no record of.
    fn on_unknown_line(&self, ctx: &mut Ctx, msg: &Message) {
        let Some(line) = msg.line() else {
            return;
        };
        match msg.message_type() {
            MessageType::Inv => self.reply(ctx, msg, MessageBody::InvAck { line }),
            t if is_lookup(t) => {
                if msg.is_broadcast() {
                    self.reply(ctx, msg, MessageBody::Ack);
                } else {
                    self.reply(
                        ctx,
                        msg,
                        MessageBody::ChngdOwnr {
                            line,
                            new_owner: NodeId::NONE,
                            certain: false,
                        },
                    );
                }
            }
            t => tracing::debug!("Dropping {:?} for unknown line {:#x}", t, line),
        }
    }

    /// Returns false if the message must wait.
    pub(crate) fn handle_line_message(&self, ctx: &mut Ctx, line: &mut Line, msg: &Message) -> bool {
        match &msg.body {
            MessageBody::Get { .. } => self.on_get(ctx, line, msg),
            MessageBody::Getx { .. } => self.on_getx(ctx, line, msg),
            MessageBody::Inv { .. } => self.on_inv(ctx, line, msg),
            MessageBody::InvAck { .. } => self.on_inv_ack(line, msg),
            MessageBody::Put { version, data, .. } => {
                self.on_put(ctx, line, msg, *version, data.clone())
            }
            MessageBody::Putx {
                version,
                sharers,
                data,
                ..
            } => self.on_putx(ctx, line, msg, *version, sharers, data.clone()),
            MessageBody::ChngdOwnr { new_owner, .. } => self.on_changed_owner(line, msg, *new_owner),
            MessageBody::NotFound { .. } => {
                self.fail_line_ops(line, msg, CacheError::RefNotFound { line: line.id })
            }
            MessageBody::Timeout { .. } => {
                self.fail_line_ops(line, msg, CacheError::Timeout { line: line.id })
            }
            MessageBody::Invoke { function, .. } => self.on_invoke(ctx, line, msg, function),
            MessageBody::InvRes { ok, payload, .. } => self.on_invoke_result(line, msg, *ok, payload),
            MessageBody::Msg { data, .. } => self.on_msg(ctx, line, msg, data),
            MessageBody::MsgAck { .. } => {
                self.complete_ops(
                    line.id,
                    |op| op.awaiting == Some(msg.message_id),
                    |_| Ok(OpValue::None),
                );
                true
            }
            _ => true,
        }
    }

    /// Reply from a node that does not own the line.
    fn not_owner_reply(&self, ctx: &mut Ctx, line: &Line, msg: &Message) {
        if msg.is_broadcast() {
            self.reply(ctx, msg, MessageBody::Ack);
            return;
        }
        let owner = if line.owner == self.me() {
            NodeId::NONE
        } else {
            line.owner
        };
        self.reply(
            ctx,
            msg,
            MessageBody::ChngdOwnr {
                line: line.id,
                new_owner: owner,
                certain: line.state == LineState::Shared,
            },
        );
    }

    fn on_get(&self, ctx: &mut Ctx, line: &mut Line, msg: &Message) -> bool {
        if !line.state.is_owner() {
            self.not_owner_reply(ctx, line, msg);
            return true;
        }
        if line.is(LineFlags::DELETED) {
            self.reply(ctx, msg, MessageBody::NotFound { line: line.id });
            return true;
        }
        if line.is(LineFlags::INCOMPLETE)
            || line.is_locked_exclusive()
            || (line.is_locked() && line.state == LineState::Exclusive)
        {
            return false;
        }
        if msg.node != self.me() {
            line.sharers.insert(msg.node);
        }
        if line.state == LineState::Exclusive && !line.sharers.is_empty() {
            line.transition(LineState::Owned);
        }
        self.reply(
            ctx,
            msg,
            MessageBody::Put {
                line: line.id,
                version: line.version,
                data: line.data.clone(),
            },
        );
        true
    }

    fn on_getx(&self, ctx: &mut Ctx, line: &mut Line, msg: &Message) -> bool {
        if !line.state.is_owner() {
            self.not_owner_reply(ctx, line, msg);
            return true;
        }
        if line.is(LineFlags::DELETED) {
            self.reply(ctx, msg, MessageBody::NotFound { line: line.id });
            return true;
        }
        if line.is_locked() || line.is(LineFlags::MODIFIED) || line.is(LineFlags::INCOMPLETE) {
            return false;
        }
        if !self.release_slave_copy(ctx, line) {
            return false;
        }
        let sharers: Vec<NodeId> = line
            .sharers
            .iter()
            .copied()
            .filter(|s| *s != msg.node)
            .collect();
        self.reply(
            ctx,
            msg,
            MessageBody::Putx {
                line: line.id,
                version: line.version,
                sharers,
                data: line.data.clone(),
            },
        );
        self.give_up_ownership(ctx, line, msg.node);
        true
    }

    fn on_inv(&self, ctx: &mut Ctx, line: &mut Line, msg: &Message) -> bool {
        if line.state.is_owner() {
            tracing::warn!(
                "Ignoring INV for line {:#x} from {}: this node owns it",
                line.id,
                msg.node
            );
            return true;
        }
        if line.is_locked() {
            return false;
        }

        let clock = {
            let mut entry = self.owner_clocks.entry(msg.node).or_insert(0);
            *entry += 1;
            *entry
        };
        let was_valid = line.state == LineState::Shared;
        let fetching = line.state == LineState::Invalid && line.next_state == Some(LineState::Shared);
        line.transition(LineState::Invalid);
        // A slave hears from its master under its own id.
        line.owner = if msg.node == self.me() {
            NodeId::NONE
        } else {
            msg.node
        };
        line.owner_clock = clock;
        if fetching {
            line.set(LineFlags::STALE_FETCH, true);
        }
        if was_valid {
            line.invalidated_at = Some(std::time::Instant::now());
            ctx.event(line, LineEvent::Invalidated { line: line.id });
        }
        self.reply(ctx, msg, MessageBody::InvAck { line: line.id });
        true
    }

    fn on_inv_ack(&self, line: &mut Line, msg: &Message) -> bool {
        if !line.state.is_owner() {
            tracing::debug!("Ignoring INVACK for line {:#x}: not the owner", line.id);
            return true;
        }
        line.sharers.remove(&msg.node);
        if line.state == LineState::Owned && line.sharers.is_empty() {
            line.set(LineFlags::INCOMPLETE, false);
            line.transition(LineState::Exclusive);
        }
        true
    }

    fn on_put(
        &self,
        ctx: &mut Ctx,
        line: &mut Line,
        msg: &Message,
        version: u64,
        data: Option<bytes::Bytes>,
    ) -> bool {
        if line.state.is_owner() {
            tracing::warn!("Ignoring PUT for line {:#x}: this node owns it", line.id);
            return true;
        }
        if line.is(LineFlags::STALE_FETCH) {
            line.set(LineFlags::STALE_FETCH, false);
            // The copy was handed out before another node took the line over.
            if msg.node != line.owner {
                tracing::debug!(
                    "Dropping PUT for line {:#x} from {}: {} owns it now",
                    line.id,
                    msg.node,
                    line.owner
                );
                line.next_state = None;
                self.want_shared(ctx, line, NodeId::NONE);
                return true;
            }
        }
        if line.state == LineState::Shared && version < line.version {
            return true;
        }
        line.version = version;
        let stored = data.as_ref().map(|d| self.copy_in(d));
        self.replace_data(line, stored);
        line.owner = msg.node;
        line.owner_clock = self.owner_clock(msg.node);
        line.invalidated_at = None;
        line.set(LineFlags::DELETED, false);
        line.transition(LineState::Shared);
        line.touch();
        ctx.event(
            line,
            LineEvent::Received {
                line: line.id,
                version,
                data,
            },
        );
        true
    }

    fn on_putx(
        &self,
        ctx: &mut Ctx,
        line: &mut Line,
        msg: &Message,
        version: u64,
        sharers: &[NodeId],
        data: Option<bytes::Bytes>,
    ) -> bool {
        if line.state.is_owner() {
            tracing::warn!("Ignoring PUTX for line {:#x}: this node owns it", line.id);
            return true;
        }
        let me = self.me();
        let wants_exclusive = line.next_state == Some(LineState::Exclusive);

        line.version = version;
        let stored = data.as_ref().map(|d| self.copy_in(d));
        self.replace_data(line, stored);
        line.owner = me;
        line.invalidated_at = None;
        line.set(LineFlags::DELETED, false);
        line.set(LineFlags::STALE_FETCH, false);
        line.sharers = sharers.iter().copied().filter(|s| *s != me && *s != msg.node).collect();
        line.touch();

        if line.sharers.is_empty() {
            line.transition(LineState::Exclusive);
        } else {
            line.next_state = None;
            line.transition(LineState::Owned);
            if wants_exclusive {
                line.next_state = Some(LineState::Exclusive);
                self.invalidate_sharers(ctx, line);
            }
        }
        ctx.event(
            line,
            LineEvent::Received {
                line: line.id,
                version,
                data,
            },
        );
        true
    }

    fn on_changed_owner(&self, line: &mut Line, msg: &Message, new_owner: NodeId) -> bool {
        if line.state.is_owner() {
            tracing::debug!("Ignoring CHNGD_OWNR for owned line {:#x}", line.id);
            return true;
        }
        line.owner = if new_owner == self.me() {
            NodeId::NONE
        } else {
            new_owner
        };

        // Requests shipped by SEND/INVOKE are reissued; otherwise the GET/GETX was
        // redirected. Hints are spent either way.
        let mut redirected_op = false;
        if let Some(mut queue) = self.pending_ops.get_mut(&line.id) {
            for pending in queue.iter_mut() {
                if pending.op.awaiting == Some(msg.message_id) {
                    pending.op.awaiting = None;
                    redirected_op = true;
                }
                pending.op.hint = NodeId::NONE;
            }
        }
        if !redirected_op {
            line.next_state = None;
            line.set(LineFlags::STALE_FETCH, false);
        }
        true
    }

    fn fail_line_ops(&self, line: &mut Line, msg: &Message, error: CacheError) -> bool {
        let id = msg.message_id;
        let shipped = self.complete_ops(line.id, |op| op.awaiting == Some(id), |_| Err(error.clone()));
        if shipped == 0 {
            // The GET/GETX behind the line's pending transition failed.
            line.next_state = None;
            line.set(LineFlags::STALE_FETCH, false);
            self.complete_ops(
                line.id,
                |op| op.awaiting.is_none() && !matches!(op.kind, OpKind::Listen(_)),
                |_| Err(error.clone()),
            );
        }
        true
    }

    fn on_invoke(&self, ctx: &mut Ctx, line: &mut Line, msg: &Message, blob: &bytes::Bytes) -> bool {
        if !line.state.is_owner() {
            self.not_owner_reply(ctx, line, msg);
            return true;
        }
        if line.is(LineFlags::DELETED) {
            self.reply(ctx, msg, MessageBody::NotFound { line: line.id });
            return true;
        }
        if line.is_locked() || line.is(LineFlags::INCOMPLETE) {
            return false;
        }
        if line.state != LineState::Exclusive {
            self.want_exclusive(ctx, line, NodeId::NONE);
            if line.state != LineState::Exclusive {
                return false;
            }
        }

        let outcome = LineFunction::from_bytes(blob.clone())
            .map_err(CacheError::from)
            .and_then(|function| self.invoke_local(line, &function));
        let body = match outcome {
            Ok(value) => MessageBody::InvRes {
                line: line.id,
                ok: true,
                payload: value.into_data(),
            },
            Err(e) => MessageBody::InvRes {
                line: line.id,
                ok: false,
                payload: Some(bytes::Bytes::from(e.to_string())),
            },
        };
        self.reply(ctx, msg, body);
        true
    }

    fn on_invoke_result(
        &self,
        line: &mut Line,
        msg: &Message,
        ok: bool,
        payload: &Option<bytes::Bytes>,
    ) -> bool {
        let id = msg.message_id;
        self.complete_ops(
            line.id,
            |op| op.awaiting == Some(id),
            |_| {
                if ok {
                    Ok(OpValue::Invoked(payload.clone()))
                } else {
                    let text = payload
                        .as_ref()
                        .map(|p| String::from_utf8_lossy(p).into_owned())
                        .unwrap_or_default();
                    Err(CacheError::Invoke(text))
                }
            },
        );
        true
    }

    fn on_msg(&self, ctx: &mut Ctx, line: &mut Line, msg: &Message, data: &Option<bytes::Bytes>) -> bool {
        if !line.state.is_owner() {
            self.not_owner_reply(ctx, line, msg);
            return true;
        }
        if line.is(LineFlags::DELETED) {
            self.reply(ctx, msg, MessageBody::NotFound { line: line.id });
            return true;
        }
        ctx.event(
            line,
            LineEvent::MessageReceived {
                line: line.id,
                from: msg.node,
                data: data.clone(),
            },
        );
        self.reply(ctx, msg, MessageBody::MsgAck { line: line.id });
        true
    }
}

/// Requests that look for the owner of a line.
fn is_lookup(t: MessageType) -> bool {
    matches!(
        t,
        MessageType::Get | MessageType::Getx | MessageType::Invoke | MessageType::Msg
    )
}
