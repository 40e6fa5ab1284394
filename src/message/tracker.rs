//! Request/response pairing.
//!
//! Outbound requests that require a reply are recorded by message id. Inbound responses
//! are only let through when they pair with a recorded request, which makes a duplicate
//! or late reply harmless. Broadcast requests collect ACKs until one peer gives a
//! definitive answer or every peer has declined.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::types::{Message, MessageBody, MessageType};
use crate::cluster::types::NodeId;

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: Message,
    pub sent_at: Instant,
    /// Peers that still owe an answer to a broadcast.
    pub awaiting: Vec<NodeId>,
}

impl PendingRequest {
    pub fn line(&self) -> Option<i64> {
        self.request.line()
    }
}

/// What to do with an inbound message after pairing.
#[derive(Debug)]
pub enum Tracked {
    Deliver(Message),
    Drop,
    /// Every broadcast peer declined; carries a locally built NOT_FOUND.
    Exhausted(Message),
}

#[derive(Default)]
pub struct RequestTracker {
    pending: DashMap<i64, PendingRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request that was handed to the transport. `peers` lists the expected
    /// responders of a broadcast and is ignored for unicast.
    pub fn track(&self, request: &Message, peers: Vec<NodeId>) {
        if !request.is_reply_required() {
            return;
        }
        let awaiting = if request.is_broadcast() {
            peers
        } else {
            Vec::new()
        };
        self.pending.insert(
            request.message_id,
            PendingRequest {
                request: request.clone(),
                sent_at: Instant::now(),
                awaiting,
            },
        );
    }

    pub fn on_inbound(&self, msg: Message) -> Tracked {
        if !msg.is_response() {
            return Tracked::Deliver(msg);
        }

        let Some(mut entry) = self.pending.get_mut(&msg.message_id) else {
            tracing::debug!(
                "Dropping unpaired {:?} #{} from {}",
                msg.message_type(),
                msg.message_id,
                msg.node
            );
            return Tracked::Drop;
        };

        if !msg.is_response_to(&entry.request) {
            tracing::debug!(
                "Dropping {:?} #{} from {}: does not answer {:?}",
                msg.message_type(),
                msg.message_id,
                msg.node,
                entry.request.message_type()
            );
            return Tracked::Drop;
        }

        if entry.request.is_broadcast() {
            let Some(pos) = entry.awaiting.iter().position(|n| *n == msg.node) else {
                return Tracked::Drop;
            };
            if msg.message_type() == MessageType::Ack {
                entry.awaiting.swap_remove(pos);
                if entry.awaiting.is_empty() {
                    let request = entry.request.clone();
                    drop(entry);
                    self.pending.remove(&msg.message_id);
                    return match exhausted_reply(&request) {
                        Some(reply) => Tracked::Exhausted(reply),
                        None => Tracked::Drop,
                    };
                }
                return Tracked::Drop;
            }
        }

        drop(entry);
        self.pending.remove(&msg.message_id);
        Tracked::Deliver(msg)
    }

    /// Forgets requests that can no longer be answered because `node` left.
    ///
    /// Returns the unicast requests that were addressed to it, plus NOT_FOUND replies for
    /// broadcasts that it was the last one to owe.
    pub fn node_gone(&self, node: NodeId) -> (Vec<Message>, Vec<Message>) {
        let mut orphaned = Vec::new();
        let mut exhausted = Vec::new();

        let ids: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some(mut entry) = self.pending.get_mut(&id) else {
                continue;
            };
            if entry.request.is_broadcast() {
                entry.awaiting.retain(|n| *n != node);
                if entry.awaiting.is_empty() {
                    let request = entry.request.clone();
                    drop(entry);
                    self.pending.remove(&id);
                    if let Some(reply) = exhausted_reply(&request) {
                        exhausted.push(reply);
                    }
                }
            } else if entry.request.node == node {
                let request = entry.request.clone();
                drop(entry);
                self.pending.remove(&id);
                orphaned.push(request);
            }
        }

        (orphaned, exhausted)
    }

    /// Drops a request the transport refused to send.
    pub fn forget(&self, message_id: i64) -> Option<PendingRequest> {
        self.pending.remove(&message_id).map(|(_, req)| req)
    }

    /// Removes and returns every request older than `timeout`.
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<PendingRequest> {
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|e| now.duration_since(e.sent_at) >= timeout)
            .map(|e| *e.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|(_, req)| req))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn exhausted_reply(request: &Message) -> Option<Message> {
    let line = request.line()?;
    let mut reply = request.reply(MessageBody::NotFound { line });
    reply.node = NodeId::NONE;
    Some(reply)
}
