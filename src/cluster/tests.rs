//! Cluster Module Tests
//!
//! Exercises the in-process transport: routing, broadcast fan-out, slave delivery and the
//! membership events raised by attach and kill.

#[cfg(test)]
mod tests {
    use crate::cluster::local::LocalNetwork;
    use crate::cluster::types::*;
    use crate::error::CommError;
    use crate::message::types::{Message, MessageBody};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
        events: Mutex<Vec<String>>,
    }

    impl MessageReceiver for Recorder {
        fn receive(&self, msg: Message) {
            self.messages.lock().push(msg);
        }
    }

    impl NodeChangeListener for Recorder {
        fn node_added(&self, node: NodeId) {
            self.events.lock().push(format!("added {}", node));
        }

        fn node_removed(&self, node: NodeId) {
            self.events.lock().push(format!("removed {}", node));
        }

        fn node_switched(&self, node: NodeId) {
            self.events.lock().push(format!("switched {}", node));
        }
    }

    fn join(
        network: &Arc<LocalNetwork>,
        node: i16,
        role: NodeRole,
    ) -> (Arc<crate::cluster::local::LocalEndpoint>, Arc<Recorder>) {
        let endpoint = network.endpoint(NodeId(node), role);
        let recorder = Arc::new(Recorder::default());
        network.attach(endpoint.clone(), recorder.clone(), Some(recorder.clone()));
        (endpoint, recorder)
    }

    // ============================================================
    // ROUTING TESTS
    // ============================================================

    #[test]
    fn test_unicast_delivery_rewrites_sender() {
        let network = LocalNetwork::new();
        let (a, _) = join(&network, 1, NodeRole::Master);
        let (_, b_rec) = join(&network, 2, NodeRole::Master);

        a.send(Message::to(NodeId(2), MessageBody::Get { line: 4 }))
            .unwrap();
        assert_eq!(network.queued(), 1);
        assert_eq!(network.deliver_all(), 1);

        let received = b_rec.messages.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].node, NodeId(1));
        assert_eq!(received[0].body, MessageBody::Get { line: 4 });
    }

    #[test]
    fn test_parked_link_is_overtaken() {
        let network = LocalNetwork::new();
        let (a, _) = join(&network, 1, NodeRole::Master);
        let (b, _) = join(&network, 2, NodeRole::Master);
        let (_, c_rec) = join(&network, 3, NodeRole::Master);

        a.send(Message::to(NodeId(3), MessageBody::Get { line: 1 })).unwrap();
        a.send(Message::to(NodeId(3), MessageBody::Get { line: 2 })).unwrap();
        b.send(Message::to(NodeId(3), MessageBody::Get { line: 3 })).unwrap();

        assert_eq!(network.park(NodeId(1), NodeId(3)), 2);
        assert_eq!(network.deliver_all(), 1);
        assert_eq!(network.unpark(), 2);
        assert_eq!(network.deliver_all(), 2);

        let lines: Vec<Option<i64>> = c_rec.messages.lock().iter().map(|m| m.line()).collect();
        assert_eq!(lines, vec![Some(3), Some(1), Some(2)]);
    }

    #[test]
    fn test_send_to_unknown_node() {
        let network = LocalNetwork::new();
        let (a, _) = join(&network, 1, NodeRole::Master);

        let err = a
            .send(Message::to(NodeId(5), MessageBody::Get { line: 1 }))
            .unwrap_err();
        assert_eq!(err, CommError::NodeNotFound(NodeId(5)));

        let err = a
            .send(Message::to(NodeId(1), MessageBody::Get { line: 1 }))
            .unwrap_err();
        assert_eq!(err, CommError::NodeNotFound(NodeId(1)));
    }

    #[test]
    fn test_broadcast_reaches_other_masters_only() {
        let network = LocalNetwork::new();
        let (a, a_rec) = join(&network, 1, NodeRole::Master);
        let (_, b_rec) = join(&network, 2, NodeRole::Master);
        let (_, c_rec) = join(&network, 3, NodeRole::Master);
        let (_, server_rec) = join(&network, 0, NodeRole::Master);

        a.send(Message::broadcast(MessageBody::Get { line: 1 }))
            .unwrap();
        network.deliver_all();

        assert!(a_rec.messages.lock().is_empty());
        assert!(server_rec.messages.lock().is_empty());
        assert_eq!(b_rec.messages.lock().len(), 1);
        assert_eq!(c_rec.messages.lock().len(), 1);
        assert_eq!(a.peers(), vec![NodeId(2), NodeId(3)]);
        assert!(a.has_server());
    }

    #[test]
    fn test_slave_channel() {
        let network = LocalNetwork::new();
        let (master, master_rec) = join(&network, 1, NodeRole::Master);
        assert!(!master.has_slaves());
        assert!(
            master
                .send_to_slaves(Message::to(NodeId(1), MessageBody::Ack))
                .is_err()
        );

        let (slave, slave_rec) = join(&network, 1, NodeRole::Slave);
        assert!(master.has_slaves());
        assert!(!slave.is_master());

        master
            .send_to_slaves(Message::to(NodeId(1), MessageBody::Ack))
            .unwrap();
        slave
            .send(Message::to(NodeId(1), MessageBody::Ack))
            .unwrap();
        network.deliver_all();

        assert_eq!(slave_rec.messages.lock().len(), 1);
        assert_eq!(master_rec.messages.lock().len(), 1);
        // The slave's arrival is announced to its master only.
        assert!(master_rec.events.lock().contains(&"added node-1".to_string()));
    }

    #[test]
    fn test_properties_are_per_node() {
        let network = LocalNetwork::new();
        let (a, _) = join(&network, 1, NodeRole::Master);
        let (b, _) = join(&network, 2, NodeRole::Master);

        a.set_property("ready", "true");
        assert_eq!(b.get_property(NodeId(1), "ready"), Some("true".to_string()));
        assert_eq!(b.get_property(NodeId(2), "ready"), None);
    }

    // ============================================================
    // MEMBERSHIP EVENT TESTS
    // ============================================================

    #[test]
    fn test_kill_without_slave_removes_node() {
        let network = LocalNetwork::new();
        let (a, a_rec) = join(&network, 1, NodeRole::Master);
        let _ = join(&network, 2, NodeRole::Master);

        network.kill(NodeId(2));

        assert!(a_rec.events.lock().contains(&"removed node-2".to_string()));
        assert!(a.peers().is_empty());
        assert!(matches!(
            a.send(Message::to(NodeId(2), MessageBody::Get { line: 1 })),
            Err(CommError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_kill_with_slave_promotes_it() {
        let network = LocalNetwork::new();
        let (a, a_rec) = join(&network, 1, NodeRole::Master);
        let _ = join(&network, 2, NodeRole::Master);
        let (slave, slave_rec) = join(&network, 2, NodeRole::Slave);

        network.kill(NodeId(2));

        assert!(slave.is_master());
        assert!(slave_rec.events.lock().contains(&"switched node-2".to_string()));
        assert!(a_rec.events.lock().contains(&"switched node-2".to_string()));
        assert_eq!(a.peers(), vec![NodeId(2)]);

        a.send(Message::to(NodeId(2), MessageBody::Get { line: 1 }))
            .unwrap();
        network.deliver_all();
        assert_eq!(slave_rec.messages.lock().len(), 1);
    }

    #[test]
    fn test_frames_for_departed_nodes_are_dropped() {
        let network = LocalNetwork::new();
        let (a, _) = join(&network, 1, NodeRole::Master);
        let (_, b_rec) = join(&network, 2, NodeRole::Master);

        a.send(Message::to(NodeId(2), MessageBody::Get { line: 1 }))
            .unwrap();
        network.kill(NodeId(2));

        assert_eq!(network.deliver_all(), 1);
        assert!(b_rec.messages.lock().is_empty());
    }
}
