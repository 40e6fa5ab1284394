//! In-process transport.
//!
//! `LocalNetwork` connects any number of nodes living in the same process. Every message
//! is encoded with the wire codec on send and decoded on delivery, and messages wait in a
//! single FIFO queue until someone pumps it with [`LocalNetwork::deliver_all`]. One queue
//! keeps the per-sender ordering the protocol relies on and makes multi-node scenarios
//! deterministic.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

use super::types::{Cluster, Comm, MessageReceiver, NodeChangeListener, NodeId, NodeRole};
use crate::alloc::refs::CounterRefAllocator;
use crate::error::CommError;
use crate::message::codec;
use crate::message::types::Message;

#[derive(Clone)]
struct Attached {
    endpoint: Arc<LocalEndpoint>,
    receiver: Arc<dyn MessageReceiver>,
    listener: Option<Arc<dyn NodeChangeListener>>,
}

#[derive(Clone, Default)]
struct NodeSlots {
    master: Option<Attached>,
    slave: Option<Attached>,
}

struct Envelope {
    from: NodeId,
    to: NodeId,
    to_slave: bool,
    frame: Bytes,
}

#[derive(Default)]
pub struct LocalNetwork {
    slots: DashMap<NodeId, NodeSlots>,
    queue: Mutex<VecDeque<Envelope>>,
    /// Frames pulled off the queue to simulate a slow link.
    parked: Mutex<VecDeque<Envelope>>,
    properties: DashMap<(NodeId, String), String>,
    /// Cluster-wide id counter shared by every node on this network.
    refs: CounterRefAllocator,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ref_allocator(&self) -> CounterRefAllocator {
        self.refs.clone()
    }

    /// Creates the endpoint a node uses as its `Cluster` and `Comm`.
    pub fn endpoint(self: &Arc<Self>, node: NodeId, role: NodeRole) -> Arc<LocalEndpoint> {
        Arc::new(LocalEndpoint {
            network: self.clone(),
            node,
            role: RwLock::new(role),
        })
    }

    /// Connects an endpoint's receiver. Attaching a master announces it to every other
    /// node; attaching a slave announces it to its own master.
    pub fn attach(
        &self,
        endpoint: Arc<LocalEndpoint>,
        receiver: Arc<dyn MessageReceiver>,
        listener: Option<Arc<dyn NodeChangeListener>>,
    ) {
        let node = endpoint.node;
        let role = endpoint.role();
        let attached = Attached {
            endpoint,
            receiver,
            listener,
        };

        {
            let mut slots = self.slots.entry(node).or_default();
            match role {
                NodeRole::Master => slots.master = Some(attached),
                NodeRole::Slave => slots.slave = Some(attached),
            }
        }

        tracing::info!("{} attached as {:?}", node, role);

        let to_notify: Vec<Arc<dyn NodeChangeListener>> = match role {
            NodeRole::Master => self.listeners_except(node),
            NodeRole::Slave => self
                .slots
                .get(&node)
                .and_then(|s| s.master.as_ref().and_then(|m| m.listener.clone()))
                .into_iter()
                .collect(),
        };
        for listener in to_notify {
            listener.node_added(node);
        }
    }

    /// Simulates a master crash. A standing-by slave takes over the node id; otherwise the
    /// node disappears from the cluster.
    pub fn kill(&self, node: NodeId) {
        let promoted = {
            let Some(mut slots) = self.slots.get_mut(&node) else {
                return;
            };
            slots.master = slots.slave.take();
            slots.master.clone()
        };

        match promoted {
            Some(new_master) => {
                new_master.endpoint.set_role(NodeRole::Master);
                tracing::info!("{} switched to its slave", node);
                if let Some(listener) = &new_master.listener {
                    listener.node_switched(node);
                }
                for listener in self.listeners_except(node) {
                    listener.node_switched(node);
                }
            }
            None => {
                self.slots.remove(&node);
                tracing::info!("{} removed from the cluster", node);
                for listener in self.listeners_except(node) {
                    listener.node_removed(node);
                }
            }
        }
    }

    /// Delivers the oldest queued message. Returns false when the queue is empty.
    pub fn deliver_next(&self) -> bool {
        let Some(envelope) = self.queue.lock().pop_front() else {
            return false;
        };

        let receiver = self.slots.get(&envelope.to).and_then(|slots| {
            let slot = if envelope.to_slave {
                &slots.slave
            } else {
                &slots.master
            };
            slot.as_ref().map(|a| a.receiver.clone())
        });

        let Some(receiver) = receiver else {
            tracing::debug!("Dropping frame for departed {}", envelope.to);
            return true;
        };

        match codec::decode(envelope.from, envelope.frame) {
            Ok(msg) => receiver.receive(msg),
            Err(e) => tracing::warn!("Failed to decode frame from {}: {}", envelope.from, e),
        }
        true
    }

    /// Pumps the queue until it is empty, including messages produced while delivering.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        while self.deliver_next() {
            delivered += 1;
        }
        delivered
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Holds back every frame currently queued from `from` to `to`, letting traffic
    /// between other nodes overtake it. Returns how many frames were parked.
    pub fn park(&self, from: NodeId, to: NodeId) -> usize {
        let mut queue = self.queue.lock();
        let mut parked = self.parked.lock();
        let before = parked.len();
        let mut kept = VecDeque::with_capacity(queue.len());
        for envelope in queue.drain(..) {
            if envelope.from == from && envelope.to == to {
                parked.push_back(envelope);
            } else {
                kept.push_back(envelope);
            }
        }
        *queue = kept;
        parked.len() - before
    }

    /// Puts parked frames back at the tail of the queue, in their original order.
    pub fn unpark(&self) -> usize {
        let mut queue = self.queue.lock();
        let mut parked = self.parked.lock();
        let count = parked.len();
        queue.extend(parked.drain(..));
        count
    }

    fn enqueue(&self, from: NodeId, to: NodeId, to_slave: bool, msg: &Message) -> Result<(), CommError> {
        let frame = match codec::encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode {:?}: {}", msg.message_type(), e);
                return Err(CommError::Closed);
            }
        };
        self.queue.lock().push_back(Envelope {
            from,
            to,
            to_slave,
            frame,
        });
        Ok(())
    }

    fn has_master(&self, node: NodeId) -> bool {
        self.slots
            .get(&node)
            .map(|s| s.master.is_some())
            .unwrap_or(false)
    }

    fn masters_except(&self, node: NodeId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .slots
            .iter()
            .filter(|e| *e.key() != node && e.key().is_peer() && e.value().master.is_some())
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    fn listeners_except(&self, node: NodeId) -> Vec<Arc<dyn NodeChangeListener>> {
        self.slots
            .iter()
            .filter(|e| *e.key() != node)
            .flat_map(|e| {
                let slots = e.value();
                [&slots.master, &slots.slave]
                    .into_iter()
                    .filter_map(|s| s.as_ref().and_then(|a| a.listener.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalEndpoint {
    network: Arc<LocalNetwork>,
    node: NodeId,
    role: RwLock<NodeRole>,
}

impl LocalEndpoint {
    pub fn role(&self) -> NodeRole {
        *self.role.read()
    }

    fn set_role(&self, role: NodeRole) {
        *self.role.write() = role;
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

impl Cluster for LocalEndpoint {
    fn my_node_id(&self) -> NodeId {
        self.node
    }

    fn is_master(&self) -> bool {
        self.role() == NodeRole::Master
    }

    fn has_server(&self) -> bool {
        self.network.has_master(NodeId::SERVER)
    }

    fn has_slaves(&self) -> bool {
        self.network
            .slots
            .get(&self.node)
            .map(|s| s.slave.is_some())
            .unwrap_or(false)
    }

    fn peers(&self) -> Vec<NodeId> {
        self.network.masters_except(self.node)
    }

    fn set_property(&self, key: &str, value: &str) {
        self.network
            .properties
            .insert((self.node, key.to_string()), value.to_string());
    }

    fn get_property(&self, node: NodeId, key: &str) -> Option<String> {
        self.network
            .properties
            .get(&(node, key.to_string()))
            .map(|v| v.value().clone())
    }
}

impl Comm for LocalEndpoint {
    fn send(&self, msg: Message) -> Result<(), CommError> {
        if msg.is_broadcast() {
            for peer in self.network.masters_except(self.node) {
                self.network.enqueue(self.node, peer, false, &msg)?;
            }
            return Ok(());
        }

        // A slave talks to its own master under the shared node id.
        let own_master = msg.node == self.node && self.role() == NodeRole::Slave;
        if (msg.node == self.node && !own_master) || !self.network.has_master(msg.node) {
            return Err(CommError::NodeNotFound(msg.node));
        }
        self.network.enqueue(self.node, msg.node, false, &msg)
    }

    fn send_to_slaves(&self, msg: Message) -> Result<(), CommError> {
        if !self.has_slaves() {
            return Err(CommError::NodeNotFound(self.node));
        }
        self.network.enqueue(self.node, self.node, true, &msg)
    }
}
