//! Backup Module Tests
//!
//! Masters replicating to a standby slave over the in-process network, packet
//! bookkeeping, and promotion of the slave when its master dies.

#[cfg(test)]
mod tests {
    use crate::backup::engine::REPLICA_READY_PROPERTY;
    use crate::cache::line::{LineSnapshot, LineState};
    use crate::cache::op::OpFuture;
    use crate::cluster::local::LocalNetwork;
    use crate::cluster::types::{Cluster, MessageReceiver, NodeId, NodeRole};
    use crate::config::GridConfig;
    use crate::error::CacheError;
    use crate::grid::node::GridNode;
    use crate::grid::registry::InvokeRegistry;
    use crate::message::types::{Message, MessageBody, MessageFlags, MessageType};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    // ============================================================
    // HARNESS
    // ============================================================

    fn node(network: &Arc<LocalNetwork>, id: i16, role: NodeRole, config: &GridConfig) -> Arc<GridNode> {
        GridNode::local(network, NodeId(id), role, config.clone(), InvokeRegistry::new())
    }

    /// Pumps messages and flushes the given masters until nothing moves.
    fn settle(network: &LocalNetwork, nodes: &[&Arc<GridNode>]) {
        for _ in 0..1_000 {
            let delivered = network.deliver_all();
            let flushed = nodes.iter().filter(|n| n.engine().flush_backups()).count();
            if delivered == 0 && flushed == 0 && network.queued() == 0 {
                return;
            }
        }
        panic!("cluster did not settle");
    }

    fn put(node: &GridNode, data: &'static str) -> i64 {
        node.store()
            .put(data, None)
            .try_take()
            .expect("PUT still pending")
            .expect("PUT failed")
            .id()
            .expect("PUT returned no id")
    }

    fn done(fut: &mut OpFuture) {
        fut.try_take()
            .expect("operation still pending")
            .expect("operation failed");
    }

    fn line(node: &GridNode, id: i64) -> LineSnapshot {
        node.engine().line(id).expect("line unknown on node")
    }

    /// Stands in for the central server: records what it is sent and never answers.
    #[derive(Default)]
    struct SilentServer {
        seen: Mutex<Vec<MessageType>>,
    }

    impl MessageReceiver for SilentServer {
        fn receive(&self, msg: Message) {
            self.seen.lock().push(msg.message_type());
        }
    }

    // ============================================================
    // REPLICATION
    // ============================================================

    #[test]
    fn test_packet_replicates_dirty_lines() {
        let network = LocalNetwork::new();
        let config = GridConfig::default();
        let master = node(&network, 1, NodeRole::Master, &config);
        let slave = node(&network, 1, NodeRole::Slave, &config);

        let a = put(&master, "a");
        let b = put(&master, "b");
        assert!(master.engine().flush_backups());
        assert!(master.engine().backup.in_flight());
        assert!(slave.engine().line(a).is_none());

        network.deliver_all();

        for (id, data) in [(a, "a"), (b, "b")] {
            let copy = line(&slave, id);
            assert_eq!(copy.state, LineState::Shared);
            assert_eq!(copy.owner, NodeId(1));
            assert_eq!(copy.data, Some(Bytes::from(data)));

            let original = line(&master, id);
            assert!(!original.modified);
            assert!(original.slave);
        }
        assert!(!master.engine().backup.in_flight());
        assert_eq!(master.store().stats().backups_pending, 0);
    }

    #[test]
    fn test_marker_makes_replica_ready() {
        let network = LocalNetwork::new();
        let config = GridConfig::default();
        let master = node(&network, 1, NodeRole::Master, &config);
        put(&master, "a");
        let slave = node(&network, 1, NodeRole::Slave, &config);
        assert!(!slave.engine().backup.is_replica_ready());

        settle(&network, &[&master]);

        assert!(slave.engine().backup.is_replica_ready());
        assert_eq!(
            master
                .engine()
                .cluster
                .get_property(NodeId(1), REPLICA_READY_PROPERTY)
                .as_deref(),
            Some("true")
        );
    }

    #[test]
    fn test_slave_follows_latest_version() {
        let network = LocalNetwork::new();
        let config = GridConfig::default();
        let master = node(&network, 1, NodeRole::Master, &config);
        let slave = node(&network, 1, NodeRole::Slave, &config);

        let id = put(&master, "a");
        settle(&network, &[&master]);
        done(&mut master.store().set(id, "b", None));
        done(&mut master.store().set(id, "c", None));
        settle(&network, &[&master]);

        let copy = line(&slave, id);
        assert_eq!(copy.version, 2);
        assert_eq!(copy.data, Some(Bytes::from("c")));
        assert!(!line(&master, id).modified);
    }

    #[test]
    fn test_outstanding_packet_blocks_next_flush() {
        let network = LocalNetwork::new();
        let config = GridConfig::default();
        let master = node(&network, 1, NodeRole::Master, &config);
        let slave = node(&network, 1, NodeRole::Slave, &config);
        let engine = master.engine();

        let first = put(&master, "a");
        assert!(engine.flush_backups());
        let second = put(&master, "b");
        assert!(!engine.flush_backups());
        assert!(line(&master, second).modified);

        network.deliver_all();
        assert!(!line(&master, first).modified);
        assert!(line(&master, second).modified);
        assert!(!slave.engine().backup.is_replica_ready());

        assert!(engine.flush_backups());
        network.deliver_all();
        assert!(!line(&master, second).modified);
        assert!(slave.engine().backup.is_replica_ready());
    }

    #[test]
    fn test_version_moves_after_enqueue() {
        let network = LocalNetwork::new();
        let master = node(&network, 1, NodeRole::Master, &GridConfig::default());
        let engine = master.engine();

        let id = put(&master, "a");
        engine.backup.version_mismatch(id, 0, 1);
        done(&mut master.store().set(id, "b", None));
        assert_eq!(engine.backup.pending(), 2);

        assert!(engine.flush_backups());
        assert_eq!(engine.backup.pending(), 0);
        let current = line(&master, id);
        assert_eq!(current.version, 1);
        assert!(!current.modified);
        assert!(engine.backup.copies_on_enqueue());

        // Copied on enqueue, then the next flush that sees no moved line goes back to
        // batching.
        done(&mut master.store().set(id, "c", None));
        assert!(engine.flush_backups());
        assert!(!engine.backup.copies_on_enqueue());
        done(&mut master.store().set(id, "d", None));
        assert!(engine.flush_backups());
        assert!(!engine.backup.copies_on_enqueue());
        assert!(!line(&master, id).modified);
    }

    #[test]
    fn test_duplicate_packet_ack_is_ignored() {
        let network = LocalNetwork::new();
        let config = GridConfig::default();
        let master = node(&network, 1, NodeRole::Master, &config);
        let slave = node(&network, 1, NodeRole::Slave, &config);
        let engine = master.engine();

        let first = put(&master, "a");
        settle(&network, &[&master]);
        assert!(slave.engine().backup.is_replica_ready());

        let second = put(&master, "b");
        assert!(engine.flush_backups());
        assert!(engine.backup.in_flight());

        // The slave acknowledges the first packet a second time.
        engine.receive(Message {
            node: NodeId(1),
            message_id: 4_242,
            flags: MessageFlags::RESPONSE,
            body: MessageBody::BackupPacketAck { packet_id: 1 },
        });

        assert!(engine.backup.in_flight());
        let pending = line(&master, second);
        assert!(pending.modified);
        assert!(!pending.slave);
        let acked = line(&master, first);
        assert!(!acked.modified);
        assert!(acked.slave);

        network.deliver_all();
        assert!(!engine.backup.in_flight());
        assert!(!line(&master, second).modified);
        assert!(line(&master, second).slave);
    }

    #[test]
    fn test_lost_server_releases_packet() {
        let network = LocalNetwork::new();
        let config = GridConfig {
            has_server: true,
            ..GridConfig::default()
        };
        let master = node(&network, 1, NodeRole::Master, &config);
        // Allocated before the server shows up, from the shared counter.
        let id = put(&master, "a");

        let server = Arc::new(SilentServer::default());
        let endpoint = network.endpoint(NodeId::SERVER, NodeRole::Master);
        network.attach(endpoint, server.clone(), None);

        assert!(master.engine().flush_backups());
        network.deliver_all();
        assert_eq!(*server.seen.lock(), vec![MessageType::BackupPacket]);
        assert!(line(&master, id).modified);

        network.kill(NodeId::SERVER);
        assert!(!master.engine().backup.in_flight());
        assert!(!line(&master, id).modified);
    }

    // ============================================================
    // STANDBY & FAILOVER
    // ============================================================

    #[test]
    fn test_slave_rejects_operations() {
        let network = LocalNetwork::new();
        let config = GridConfig::default();
        let master = node(&network, 1, NodeRole::Master, &config);
        let slave = node(&network, 1, NodeRole::Slave, &config);
        let id = put(&master, "a");

        let result = slave.store().get(id).try_take().expect("slave answers at once");
        assert!(matches!(result, Err(CacheError::IllegalState(_))));
        assert!(!slave.engine().flush_backups());
    }

    #[test]
    fn test_promotion_requires_complete_replica() {
        let network = LocalNetwork::new();
        let config = GridConfig::default();
        let master = node(&network, 1, NodeRole::Master, &config);
        put(&master, "a");
        let slave = node(&network, 1, NodeRole::Slave, &config);

        assert!(matches!(
            slave.engine().switch_to_master(),
            Err(CacheError::IllegalState(_))
        ));
    }

    #[test]
    fn test_failover_promotes_replica() {
        let network = LocalNetwork::new();
        let config = GridConfig::default();
        let master = node(&network, 1, NodeRole::Master, &config);
        let slave = node(&network, 1, NodeRole::Slave, &config);
        let reader = node(&network, 2, NodeRole::Master, &config);

        let id = put(&master, "x");
        settle(&network, &[&master, &reader]);
        let mut read = reader.store().get(id);
        settle(&network, &[&master, &reader]);
        done(&mut read);
        assert_eq!(line(&master, id).sharers, vec![NodeId(2)]);

        network.kill(NodeId(1));
        assert_eq!(slave.role(), NodeRole::Master);

        let promoted = line(&slave, id);
        assert_eq!(promoted.state, LineState::Exclusive);
        assert!(promoted.sharers.is_empty());
        assert_eq!(promoted.data, Some(Bytes::from("x")));

        // Its copy may be older than what the dead master handed out.
        let copy = line(&reader, id);
        assert_eq!(copy.state, LineState::Invalid);
        assert_eq!(copy.owner, NodeId(1));

        let mut again = reader.store().get(id);
        settle(&network, &[&slave, &reader]);
        let value = again
            .try_take()
            .expect("read still pending")
            .expect("read failed")
            .into_data();
        assert_eq!(value, Some(Bytes::from("x")));
        assert_eq!(line(&slave, id).sharers, vec![NodeId(2)]);
    }

    #[test]
    fn test_pushx_releases_slave_copy() {
        let network = LocalNetwork::new();
        let config = GridConfig::default();
        let master = node(&network, 1, NodeRole::Master, &config);
        let slave = node(&network, 1, NodeRole::Slave, &config);
        let target = node(&network, 2, NodeRole::Master, &config);

        let id = put(&master, "a");
        let mut push = master.store().pushx(id, NodeId(2));
        assert!(push.try_take().is_none());
        settle(&network, &[&master, &target]);
        done(&mut push);

        assert_eq!(line(&target, id).state, LineState::Exclusive);
        assert_eq!(line(&master, id).state, LineState::Invalid);
        assert_eq!(line(&slave, id).state, LineState::Invalid);
    }
}
