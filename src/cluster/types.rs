use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CommError;
use crate::message::types::Message;

/// Identifier of a cluster member.
///
/// A master and its slave share the same id. `NONE` stands for an unknown owner and
/// `SERVER` for the central server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub i16);

impl NodeId {
    pub const NONE: NodeId = NodeId(-1);
    pub const SERVER: NodeId = NodeId(0);

    pub fn is_none(self) -> bool {
        self.0 < 0
    }

    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }

    /// A real peer: neither unknown nor the server.
    pub fn is_peer(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            -1 => write!(f, "none"),
            0 => write!(f, "server"),
            n => write!(f, "node-{}", n),
        }
    }
}

/// Whether this process serves its node id or stands by for it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Slave,
}

/// Cluster membership as seen by one node.
pub trait Cluster: Send + Sync {
    fn my_node_id(&self) -> NodeId;

    fn is_master(&self) -> bool;

    fn has_server(&self) -> bool;

    /// True when a standby replica is attached to this node.
    fn has_slaves(&self) -> bool;

    /// Other live masters, excluding this node and the server.
    fn peers(&self) -> Vec<NodeId>;

    fn set_property(&self, key: &str, value: &str);

    fn get_property(&self, node: NodeId, key: &str) -> Option<String>;
}

/// Message transport.
///
/// `send` routes on `msg.node` (the destination) unless the message carries the
/// BROADCAST flag, in which case it goes to every other master. The receiving side sees
/// `msg.node` rewritten to the sender.
pub trait Comm: Send + Sync {
    fn send(&self, msg: Message) -> Result<(), CommError>;

    fn send_to_slaves(&self, msg: Message) -> Result<(), CommError>;
}

pub trait MessageReceiver: Send + Sync {
    fn receive(&self, msg: Message);
}

/// Membership events.
///
/// `node_switched` reports that a node's slave took over as master; a node receiving it
/// for its own id while standing by is being promoted. `node_added` for a node's own id
/// reports a slave joining.
pub trait NodeChangeListener: Send + Sync {
    fn node_added(&self, node: NodeId);

    fn node_removed(&self, node: NodeId);

    fn node_switched(&self, node: NodeId);
}
