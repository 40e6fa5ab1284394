//! Cache Module Tests
//!
//! Line bookkeeping in isolation, then the coherence protocol driven through small
//! in-process clusters. Messages only move when a test pumps the network, so every
//! interleaving below is deterministic.

#[cfg(test)]
mod tests {
    use crate::alloc::refs::RefAllocationListener;
    use crate::cache::engine::Engine;
    use crate::cache::line::{Line, LineFlags, LineSnapshot, LineState, LockState};
    use crate::cache::listener::{CacheListener, ErrorSink, LineEvent};
    use crate::cache::op::{OpFuture, OpValue};
    use crate::cache::store::LineStore;
    use crate::cluster::local::LocalNetwork;
    use crate::cluster::types::{MessageReceiver, NodeId, NodeRole};
    use crate::config::GridConfig;
    use crate::error::{CacheError, CacheResult};
    use crate::grid::node::GridNode;
    use crate::grid::registry::{InvokeOutcome, InvokeRegistry};
    use crate::grid::store::Store;
    use crate::message::types::{LineFunction, Message, MessageBody, MessageFlags};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    // ============================================================
    // HARNESS
    // ============================================================

    struct TestCluster {
        network: Arc<LocalNetwork>,
        nodes: Vec<Arc<GridNode>>,
    }

    impl TestCluster {
        fn new(masters: i16, config: GridConfig) -> Self {
            Self::with_functions(masters, config, InvokeRegistry::new())
        }

        fn with_functions(masters: i16, config: GridConfig, functions: Arc<InvokeRegistry>) -> Self {
            let network = LocalNetwork::new();
            let nodes = (1..=masters)
                .map(|id| {
                    GridNode::local(
                        &network,
                        NodeId(id),
                        NodeRole::Master,
                        config.clone(),
                        functions.clone(),
                    )
                })
                .collect();
            Self { network, nodes }
        }

        fn store(&self, node: i16) -> &Store {
            self.nodes[(node - 1) as usize].store()
        }

        fn engine(&self, node: i16) -> &Arc<Engine> {
            self.nodes[(node - 1) as usize].engine()
        }

        /// Delivers messages and flushes backups until nothing moves.
        fn settle(&self) {
            for _ in 0..1_000 {
                let delivered = self.network.deliver_all();
                let flushed = self
                    .nodes
                    .iter()
                    .filter(|n| n.engine().flush_backups())
                    .count();
                if delivered == 0 && flushed == 0 && self.network.queued() == 0 {
                    return;
                }
            }
            panic!("cluster did not settle");
        }

        fn put(&self, node: i16, data: &'static str) -> i64 {
            let mut fut = self.store(node).put(data, None);
            take(&mut fut)
                .expect("PUT failed")
                .id()
                .expect("PUT returned no id")
        }

        fn line(&self, node: i16, line: i64) -> LineSnapshot {
            self.engine(node).line(line).expect("line unknown on node")
        }
    }

    fn take(fut: &mut OpFuture) -> CacheResult<OpValue> {
        fut.try_take().expect("operation still pending")
    }

    fn read(fut: &mut OpFuture) -> Option<Bytes> {
        take(fut).expect("read failed").into_data()
    }

    fn bytes(s: &'static str) -> Option<Bytes> {
        Some(Bytes::from(s))
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl CacheListener for Recorder {
        fn received(&self, line: i64, version: u64, _data: Option<&Bytes>) -> anyhow::Result<()> {
            self.events.lock().push(format!("received {:#x} v{}", line, version));
            Ok(())
        }

        fn invalidated(&self, line: i64) -> anyhow::Result<()> {
            self.events.lock().push(format!("invalidated {:#x}", line));
            Ok(())
        }

        fn evicted(&self, line: i64) -> anyhow::Result<()> {
            self.events.lock().push(format!("evicted {:#x}", line));
            Ok(())
        }

        fn killed(&self, line: i64) -> anyhow::Result<()> {
            self.events.lock().push(format!("killed {:#x}", line));
            Ok(())
        }

        fn message_received(&self, line: i64, from: NodeId, data: Option<&Bytes>) -> anyhow::Result<()> {
            let text = data.map(|d| String::from_utf8_lossy(d).into_owned()).unwrap_or_default();
            self.events
                .lock()
                .push(format!("message {:#x} from {} {}", line, from, text));
            Ok(())
        }
    }

    // ============================================================
    // LINE BOOKKEEPING
    // ============================================================

    #[test]
    fn test_states_are_ordered() {
        assert!(LineState::Invalid < LineState::Shared);
        assert!(LineState::Shared < LineState::Owned);
        assert!(LineState::Owned < LineState::Exclusive);
        assert!(LineState::Owned.is_owner());
        assert!(!LineState::Shared.is_owner());
    }

    #[test]
    fn test_transition_clears_reached_marker() {
        let mut line = Line::new(7);
        line.next_state = Some(LineState::Shared);
        line.transition(LineState::Shared);
        assert_eq!(line.next_state, None);

        line.next_state = Some(LineState::Exclusive);
        line.transition(LineState::Owned);
        assert_eq!(line.next_state, Some(LineState::Exclusive));
    }

    #[test]
    fn test_losing_ownership_drops_directory() {
        let mut line = Line::allocated(7, NodeId(1), None);
        line.sharers.insert(NodeId(2));
        line.set(LineFlags::INCOMPLETE, true);
        line.transition(LineState::Invalid);

        assert!(line.sharers.is_empty());
        assert!(!line.is(LineFlags::INCOMPLETE));
    }

    #[test]
    fn test_lock_counting() {
        let mut line = Line::new(1);
        line.lock_shared();
        line.lock_shared();
        line.unlock_shared();
        assert_eq!(line.lock, LockState::Shared(1));
        line.unlock_shared();
        assert!(!line.is_locked());

        line.lock_exclusive(7);
        assert!(!line.is_write_locked_by_other(Some(7)));
        assert!(line.is_write_locked_by_other(Some(8)));
        assert!(line.is_write_locked_by_other(None));
        line.unlock_exclusive(8);
        assert!(line.is_locked());
        line.unlock_exclusive(7);
        assert!(!line.is_locked());
    }

    #[test]
    fn test_clock_ring_holds_each_line_once() {
        let store = LineStore::new(1_000);
        let cell = store.get_or_create(7);
        for _ in 0..10_000 {
            let mut line = cell.lock();
            line.state = LineState::Exclusive;
            store.relocate(&line, &cell);
            line.state = LineState::Invalid;
            store.relocate(&line, &cell);
        }

        assert_eq!(store.shared_count(), 1);
        assert_eq!(store.owned_count(), 0);
        assert_eq!(store.clock_len(), 1);
        assert!(matches!(store.clock_next(), Some((7, _))));
        assert!(store.clock_next().is_none());
    }

    #[test]
    fn test_owned_line_leaves_clock_ring() {
        let store = LineStore::new(1_000);
        let cell = store.get_or_create(7);
        store.get_or_create(8);
        {
            let mut line = cell.lock();
            line.state = LineState::Owned;
            store.relocate(&line, &cell);
        }
        assert_eq!(store.clock_len(), 1);

        store.remove(8);
        assert_eq!(store.clock_len(), 0);
        assert_eq!(store.shared_count(), 0);
        assert_eq!(store.owned_count(), 1);
    }

    // ============================================================
    // SINGLE NODE
    // ============================================================

    #[test]
    fn test_put_then_get_locally() {
        let cluster = TestCluster::new(1, GridConfig::default());
        let id = cluster.put(1, "hello");

        let mut fut = cluster.store(1).get(id);
        assert_eq!(read(&mut fut), bytes("hello"));

        let line = cluster.line(1, id);
        assert_eq!(line.state, LineState::Exclusive);
        assert_eq!(line.version, 0);
        assert!(line.modified);

        // Nobody to back up to: the flush acknowledges locally.
        cluster.settle();
        assert!(!cluster.line(1, id).modified);
    }

    #[test]
    fn test_write_bumps_version_and_delete_kills_line() {
        let cluster = TestCluster::new(1, GridConfig::default());
        let store = cluster.store(1);
        let id = cluster.put(1, "a");

        take(&mut store.set(id, "b", None)).unwrap();
        assert_eq!(cluster.line(1, id).version, 1);

        take(&mut store.del(id, None)).unwrap();
        let line = cluster.line(1, id);
        assert!(line.deleted);
        assert_eq!(line.version, 2);
        assert_eq!(
            take(&mut store.get(id)),
            Err(CacheError::RefNotFound { line: id })
        );
    }

    #[test]
    fn test_backed_up_delete_drops_line() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let ids: Vec<i64> = (0..50).map(|_| cluster.put(1, "a")).collect();
        for id in &ids {
            take(&mut cluster.store(1).del(*id, None)).unwrap();
        }
        // Tombstones stay until the deletion is backed up.
        assert_eq!(cluster.engine(1).stats().owned_lines, 50);
        assert!(cluster.line(1, ids[0]).deleted);

        cluster.settle();
        let stats = cluster.engine(1).stats();
        assert_eq!(stats.owned_lines, 0);
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.backups_pending, 0);
        assert!(cluster.engine(1).line(ids[0]).is_none());

        let mut read = cluster.store(2).get(ids[0]);
        cluster.settle();
        assert_eq!(take(&mut read), Err(CacheError::RefNotFound { line: ids[0] }));
    }

    #[test]
    fn test_item_size_is_enforced() {
        let config = GridConfig {
            max_item_size: 8,
            ..GridConfig::default()
        };
        let cluster = TestCluster::new(1, config);
        let store = cluster.store(1);
        let id = cluster.put(1, "small");

        assert_eq!(
            take(&mut store.set(id, "123456789", None)),
            Err(CacheError::ItemTooLarge { size: 9, max: 8 })
        );
        assert_eq!(
            take(&mut store.put("123456789", None)),
            Err(CacheError::ItemTooLarge { size: 9, max: 8 })
        );
    }

    #[test]
    fn test_alloc_hands_out_consecutive_ids() {
        let cluster = TestCluster::new(1, GridConfig::default());
        let store = cluster.store(1);

        let first = take(&mut store.alloc(3, None)).unwrap().id().unwrap();
        for offset in 0..3 {
            let line = cluster.line(1, first + offset);
            assert_eq!(line.state, LineState::Exclusive);
            assert_eq!(line.data, None);
        }
        let next = cluster.put(1, "x");
        assert_eq!(next, first + 3);

        assert!(matches!(
            take(&mut store.alloc(0, None)),
            Err(CacheError::IllegalState(_))
        ));
    }

    #[test]
    fn test_negative_id_is_not_found() {
        let cluster = TestCluster::new(1, GridConfig::default());
        assert_eq!(
            take(&mut cluster.store(1).get(-5)),
            Err(CacheError::RefNotFound { line: -5 })
        );
    }

    #[test]
    fn test_allocator_ready_prefetches_a_batch() {
        let config = GridConfig {
            alloc_batch_size: 16,
            ..GridConfig::default()
        };
        let cluster = TestCluster::new(1, config);
        let engine = cluster.engine(1);
        assert_eq!(engine.stats().free_ids, 0);

        engine.allocator_ready();
        assert_eq!(engine.stats().free_ids, 16);
    }

    // ============================================================
    // COHERENCE
    // ============================================================

    #[test]
    fn test_remote_get_makes_sharer() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "x");

        let mut fut = cluster.store(2).get(id);
        assert!(fut.try_take().is_none());
        cluster.settle();
        assert_eq!(read(&mut fut), bytes("x"));

        let reader = cluster.line(2, id);
        assert_eq!(reader.state, LineState::Shared);
        assert_eq!(reader.owner, NodeId(1));

        let owner = cluster.line(1, id);
        assert_eq!(owner.state, LineState::Owned);
        assert_eq!(owner.sharers, vec![NodeId(2)]);
    }

    #[test]
    fn test_owner_hint_skips_broadcast() {
        let cluster = TestCluster::new(3, GridConfig::default());
        let id = cluster.put(1, "x");
        cluster.settle();

        let mut fut = cluster.store(2).getx_from_owner(id, NodeId(1), None);
        assert_eq!(cluster.network.queued(), 1);
        cluster.settle();
        assert_eq!(read(&mut fut), bytes("x"));

        let taker = cluster.line(2, id);
        assert_eq!(taker.state, LineState::Exclusive);
        assert_eq!(taker.owner, NodeId(2));
        assert!(cluster.engine(3).line(id).is_none());
    }

    #[test]
    fn test_concurrent_writers_leave_one_exclusive_owner() {
        let cluster = TestCluster::new(3, GridConfig::default());
        let id = cluster.put(1, "a");
        cluster.settle();

        let mut from_2 = cluster.store(2).set(id, "b", None);
        let mut from_3 = cluster.store(3).set(id, "c", None);
        cluster.settle();
        take(&mut from_2).unwrap();
        take(&mut from_3).unwrap();

        let exclusive: Vec<i16> = (1..=3)
            .filter(|n| cluster.line(*n, id).state == LineState::Exclusive)
            .collect();
        assert_eq!(exclusive, vec![3]);

        let winner = cluster.line(3, id);
        assert_eq!(winner.data, bytes("c"));
        assert_eq!(winner.version, 2);
        assert_eq!(cluster.line(1, id).state, LineState::Invalid);
        assert_eq!(cluster.line(2, id).state, LineState::Invalid);
    }

    #[test]
    fn test_late_put_from_previous_owner_is_refetched() {
        let cluster = TestCluster::new(3, GridConfig::default());
        let id = cluster.put(1, "v0");
        cluster.settle();

        // Node 1 answers node 2's read, but the copy is slow to arrive.
        let mut slow_read = cluster.store(2).get_from_owner(id, NodeId(1));
        assert!(cluster.network.deliver_next());
        assert_eq!(cluster.network.park(NodeId(1), NodeId(2)), 1);

        // Node 3 takes the line over and invalidates node 2 before the copy lands.
        let mut takeover = cluster.store(3).getx_from_owner(id, NodeId(1), None);
        cluster.network.deliver_all();
        assert_eq!(read(&mut takeover), bytes("v0"));
        assert_eq!(cluster.line(3, id).state, LineState::Exclusive);
        assert!(slow_read.try_take().is_none());
        assert_eq!(cluster.line(2, id).owner, NodeId(3));

        // The old owner's copy is discarded and the read goes to node 3 instead.
        assert_eq!(cluster.network.unpark(), 1);
        cluster.settle();
        assert_eq!(read(&mut slow_read), bytes("v0"));
        let copy = cluster.line(2, id);
        assert_eq!(copy.state, LineState::Shared);
        assert_eq!(copy.owner, NodeId(3));
        let owner = cluster.line(3, id);
        assert_eq!(owner.state, LineState::Owned);
        assert_eq!(owner.sharers, vec![NodeId(2)]);

        // Node 3 knows about the copy, so its next write reaches it.
        let mut write = cluster.store(3).set(id, "v1", None);
        cluster.settle();
        take(&mut write).unwrap();
        assert_eq!(cluster.line(2, id).state, LineState::Invalid);
        assert_eq!(cluster.line(3, id).state, LineState::Exclusive);
    }

    #[test]
    fn test_getx_invalidates_remaining_sharers() {
        let cluster = TestCluster::new(3, GridConfig::default());
        let id = cluster.put(1, "a");
        cluster.settle();
        let mut r2 = cluster.store(2).get(id);
        let mut r3 = cluster.store(3).get(id);
        cluster.settle();
        read(&mut r2);
        read(&mut r3);

        let mut write = cluster.store(2).set(id, "b", None);
        cluster.settle();
        take(&mut write).unwrap();

        let new_owner = cluster.line(2, id);
        assert_eq!(new_owner.state, LineState::Exclusive);
        assert!(new_owner.sharers.is_empty());
        assert!(!new_owner.incomplete);

        let old_sharer = cluster.line(3, id);
        assert_eq!(old_sharer.state, LineState::Invalid);
        assert_eq!(old_sharer.owner, NodeId(2));
        assert_eq!(cluster.line(1, id).owner, NodeId(2));
    }

    #[test]
    fn test_owner_write_waits_for_inv_acks() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");
        let mut r = cluster.store(2).get(id);
        cluster.settle();
        read(&mut r);

        let mut write = cluster.store(1).set(id, "b", None);
        assert!(write.try_take().is_none());
        assert!(cluster.line(1, id).incomplete);

        cluster.settle();
        take(&mut write).unwrap();
        let owner = cluster.line(1, id);
        assert_eq!(owner.state, LineState::Exclusive);
        assert_eq!(owner.data, bytes("b"));
        assert_eq!(cluster.line(2, id).state, LineState::Invalid);
    }

    #[test]
    fn test_unpaired_inv_ack_is_ignored() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");
        cluster.settle();
        let before = cluster.line(1, id);

        cluster.engine(1).receive(Message {
            node: NodeId(2),
            message_id: 9_999,
            flags: MessageFlags::RESPONSE,
            body: MessageBody::InvAck { line: id },
        });

        let after = cluster.line(1, id);
        assert_eq!(after.state, before.state);
        assert_eq!(after.sharers, before.sharers);
        assert_eq!(after.version, before.version);
    }

    #[test]
    fn test_evicted_sharer_still_acknowledges_inv() {
        let config = GridConfig {
            max_shared_lines: 2,
            ..GridConfig::default()
        };
        let cluster = TestCluster::new(2, config);
        let recorder = Arc::new(Recorder::default());
        cluster.store(2).add_listener(recorder.clone());

        let ids: Vec<i64> = ["a", "b", "c", "d"].into_iter().map(|d| cluster.put(1, d)).collect();
        cluster.settle();
        let mut reads: Vec<OpFuture> = ids.iter().map(|id| cluster.store(2).get(*id)).collect();
        cluster.settle();
        for fut in reads.iter_mut() {
            assert!(read(fut).is_some());
        }

        assert!(cluster.engine(2).stats().shared_lines <= 2);
        let evictions = recorder
            .events()
            .iter()
            .filter(|e| e.starts_with("evicted"))
            .count();
        assert!(evictions >= 2);

        // The owner still lists node 2 as a sharer of the evicted lines.
        let mut writes: Vec<OpFuture> = ids
            .iter()
            .map(|id| cluster.store(1).set(*id, "z", None))
            .collect();
        cluster.settle();
        for fut in writes.iter_mut() {
            take(fut).unwrap();
        }
    }

    #[test]
    fn test_listened_line_is_not_evicted() {
        let config = GridConfig {
            max_shared_lines: 1,
            ..GridConfig::default()
        };
        let cluster = TestCluster::new(2, config);
        let watched = cluster.put(1, "w");
        let others: Vec<i64> = ["a", "b", "c"].into_iter().map(|d| cluster.put(1, d)).collect();
        cluster.settle();

        let recorder = Arc::new(Recorder::default());
        take(&mut cluster.store(2).set_listener(watched, Some(recorder.clone()))).unwrap();
        let mut reads: Vec<OpFuture> = others.iter().map(|id| cluster.store(2).get(*id)).collect();
        cluster.settle();
        for fut in reads.iter_mut() {
            assert!(read(fut).is_some());
        }
        assert!(cluster.engine(2).line(watched).is_some());

        let mut r = cluster.store(2).get(watched);
        cluster.settle();
        assert_eq!(read(&mut r), bytes("w"));
        assert_eq!(recorder.events(), vec![format!("received {:#x} v0", watched)]);
    }

    // ============================================================
    // STALE READS
    // ============================================================

    #[test]
    fn test_stale_read_until_owner_invalidates_again() {
        let config = GridConfig {
            max_stale_read_ms: 60_000,
            ..GridConfig::default()
        };
        let cluster = TestCluster::new(2, config);
        let first = cluster.put(1, "a");
        let second = cluster.put(1, "m");
        let mut r1 = cluster.store(2).get(first);
        let mut r2 = cluster.store(2).get(second);
        cluster.settle();
        read(&mut r1);
        read(&mut r2);

        let mut w = cluster.store(1).set(first, "b", None);
        cluster.settle();
        take(&mut w).unwrap();
        assert_eq!(cluster.line(2, first).state, LineState::Invalid);

        // Served from the invalidated copy without a round trip.
        let mut stale = cluster.store(2).get(first);
        assert_eq!(read(&mut stale), bytes("a"));
        assert_eq!(cluster.network.queued(), 0);

        // A later invalidation from the same owner ends the grace.
        let mut w = cluster.store(1).set(second, "n", None);
        cluster.settle();
        take(&mut w).unwrap();

        let mut fresh = cluster.store(2).get(first);
        assert!(fresh.try_take().is_none());
        cluster.settle();
        assert_eq!(read(&mut fresh), bytes("b"));
    }

    #[test]
    fn test_stale_reads_disabled_by_default() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");
        let mut r = cluster.store(2).get(id);
        cluster.settle();
        read(&mut r);
        let mut w = cluster.store(1).set(id, "b", None);
        cluster.settle();
        take(&mut w).unwrap();

        let mut again = cluster.store(2).get(id);
        assert!(again.try_take().is_none());
        cluster.settle();
        assert_eq!(read(&mut again), bytes("b"));
    }

    // ============================================================
    // TRANSACTIONS
    // ============================================================

    #[test]
    fn test_rollback_restores_pre_image() {
        let cluster = TestCluster::new(1, GridConfig::default());
        let store = cluster.store(1);
        let id = cluster.put(1, "a");
        cluster.settle();

        let txn = store.begin_transaction();
        take(&mut store.set(id, "b", Some(&txn))).unwrap();
        take(&mut store.set(id, "c", Some(&txn))).unwrap();
        let during = cluster.line(1, id);
        assert!(during.locked);
        assert_eq!(during.version, 2);

        store.rollback(&txn).unwrap();
        let after = cluster.line(1, id);
        assert_eq!(after.data, bytes("a"));
        assert_eq!(after.version, 0);
        assert!(!after.modified);
        assert!(!after.locked);

        assert!(matches!(
            take(&mut store.set(id, "d", Some(&txn))),
            Err(CacheError::IllegalState(_))
        ));
        assert!(store.commit(&txn).is_err());
    }

    #[test]
    fn test_shared_lock_cannot_upgrade() {
        let cluster = TestCluster::new(1, GridConfig::default());
        let store = cluster.store(1);
        let id = cluster.put(1, "a");

        let txn = store.begin_transaction();
        assert_eq!(read(&mut store.gets(id, &txn)), bytes("a"));
        assert_eq!(
            take(&mut store.getx(id, Some(&txn))),
            Err(CacheError::IllegalUpgrade { line: id })
        );
        store.commit(&txn).unwrap();
        assert!(!cluster.line(1, id).locked);
    }

    #[test]
    fn test_locked_line_holds_remote_get_until_commit() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");
        cluster.settle();

        let txn = cluster.store(1).begin_transaction();
        take(&mut cluster.store(1).set(id, "b", Some(&txn))).unwrap();

        let mut remote = cluster.store(2).get(id);
        cluster.settle();
        assert!(remote.try_take().is_none());
        assert!(cluster.engine(1).stats().held_messages > 0);

        cluster.store(1).commit(&txn).unwrap();
        cluster.settle();
        assert_eq!(read(&mut remote), bytes("b"));
        assert_eq!(cluster.line(2, id).version, 1);
    }

    // ============================================================
    // OWNER-DIRECTED OPERATIONS
    // ============================================================

    fn append_functions() -> Arc<InvokeRegistry> {
        let functions = InvokeRegistry::new();
        functions.register("append", |data, args| {
            let mut joined = data.map(|d| d.to_vec()).unwrap_or_default();
            joined.extend_from_slice(args);
            let joined = Bytes::from(joined);
            Ok(InvokeOutcome {
                update: Some(joined.clone()),
                result: Some(joined),
            })
        });
        functions
    }

    #[test]
    fn test_invoke_runs_on_owner() {
        let cluster = TestCluster::with_functions(2, GridConfig::default(), append_functions());
        let id = cluster.put(1, "ab");

        let mut remote = cluster
            .store(2)
            .invoke(id, LineFunction::new("append", "c"), None);
        cluster.settle();
        assert_eq!(take(&mut remote).unwrap(), OpValue::Invoked(bytes("abc")));

        let owner = cluster.line(1, id);
        assert_eq!(owner.data, bytes("abc"));
        assert_eq!(owner.version, 1);

        let mut local = cluster
            .store(1)
            .invoke(id, LineFunction::new("append", "d"), None);
        assert_eq!(take(&mut local).unwrap(), OpValue::Invoked(bytes("abcd")));
    }

    #[test]
    fn test_unknown_function_fails_invoke() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "ab");

        let mut remote = cluster.store(2).invoke(id, LineFunction::new("nope", ""), None);
        cluster.settle();
        assert!(matches!(take(&mut remote), Err(CacheError::Invoke(_))));
        assert_eq!(cluster.line(1, id).data, bytes("ab"));
    }

    #[test]
    fn test_send_reaches_owner_listener() {
        let cluster = TestCluster::new(3, GridConfig::default());
        let id = cluster.put(1, "a");
        let recorder = Arc::new(Recorder::default());
        take(&mut cluster.store(1).set_listener(id, Some(recorder.clone()))).unwrap();

        let mut sent = cluster.store(2).send(id, "hi");
        cluster.settle();
        take(&mut sent).unwrap();

        assert_eq!(
            recorder.events(),
            vec![format!("message {:#x} from node-2 hi", id)]
        );
    }

    #[test]
    fn test_push_shares_current_version() {
        let cluster = TestCluster::new(3, GridConfig::default());
        let id = cluster.put(1, "a");

        take(&mut cluster.store(1).push(id, vec![NodeId(2), NodeId(3)])).unwrap();
        cluster.settle();

        let owner = cluster.line(1, id);
        assert_eq!(owner.state, LineState::Owned);
        assert_eq!(owner.sharers, vec![NodeId(2), NodeId(3)]);
        for node in [2, 3] {
            let copy = cluster.line(node, id);
            assert_eq!(copy.state, LineState::Shared);
            assert_eq!(copy.data, bytes("a"));
        }

        // Not the owner: a no-op.
        take(&mut cluster.store(2).push(id, vec![NodeId(3)])).unwrap();
    }

    #[test]
    fn test_pushx_waits_for_backup_then_hands_over() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");

        let mut push = cluster.store(1).pushx(id, NodeId(2));
        assert!(push.try_take().is_none());
        cluster.settle();
        take(&mut push).unwrap();

        let receiver = cluster.line(2, id);
        assert_eq!(receiver.state, LineState::Exclusive);
        assert_eq!(receiver.owner, NodeId(2));
        assert_eq!(receiver.data, bytes("a"));

        let previous = cluster.line(1, id);
        assert_eq!(previous.state, LineState::Invalid);
        assert_eq!(previous.owner, NodeId(2));
    }

    // ============================================================
    // LISTENERS
    // ============================================================

    #[test]
    fn test_line_listener_sees_copy_lifecycle() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");
        let recorder = Arc::new(Recorder::default());
        take(&mut cluster.store(2).set_listener(id, Some(recorder.clone()))).unwrap();

        let mut r = cluster.store(2).get(id);
        cluster.settle();
        read(&mut r);
        let mut w = cluster.store(1).set(id, "b", None);
        cluster.settle();
        take(&mut w).unwrap();

        assert_eq!(
            recorder.events(),
            vec![format!("received {:#x} v0", id), format!("invalidated {:#x}", id)]
        );
    }

    /// Tries a blocking read from inside a message callback.
    struct WaitsInCallback {
        store: Store,
        outcome: Mutex<Option<CacheResult<OpValue>>>,
    }

    impl CacheListener for WaitsInCallback {
        fn message_received(&self, line: i64, _from: NodeId, _data: Option<&Bytes>) -> anyhow::Result<()> {
            let outcome = self.store.get(line).wait();
            *self.outcome.lock() = Some(outcome);
            Ok(())
        }
    }

    #[test]
    fn test_wait_refused_while_dispatching() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");
        let listener = Arc::new(WaitsInCallback {
            store: Store::new(cluster.engine(1).clone()),
            outcome: Mutex::new(None),
        });
        take(&mut cluster.store(1).set_listener(id, Some(listener.clone()))).unwrap();

        let mut sent = cluster.store(2).send(id, "hi");
        cluster.settle();
        take(&mut sent).unwrap();

        let outcome = listener.outcome.lock().take();
        assert!(matches!(outcome, Some(Err(CacheError::IllegalState(_)))));
        // The same call from the test thread itself is fine.
        assert_eq!(cluster.store(1).get(id).wait().unwrap().into_data(), bytes("a"));
    }

    #[derive(Default)]
    struct CountingSink {
        failures: Mutex<Vec<i64>>,
    }

    impl ErrorSink for CountingSink {
        fn listener_failed(&self, event: &LineEvent, _error: &anyhow::Error) {
            self.failures.lock().push(event.line());
        }
    }

    struct Failing;

    impl CacheListener for Failing {
        fn killed(&self, _line: i64) -> anyhow::Result<()> {
            anyhow::bail!("listener refused")
        }
    }

    #[test]
    fn test_listener_failure_goes_to_sink() {
        let network = LocalNetwork::new();
        let endpoint = network.endpoint(NodeId(1), NodeRole::Master);
        let sink = Arc::new(CountingSink::default());
        let engine = Engine::builder(GridConfig::default(), endpoint.clone(), endpoint.clone())
            .error_sink(sink.clone())
            .build();
        network.attach(endpoint, engine.clone(), Some(engine.clone()));
        let store = Store::new(engine);
        store.add_listener(Arc::new(Failing));

        let id = take(&mut store.put("a", None)).unwrap().id().unwrap();
        take(&mut store.del(id, None)).unwrap();

        assert_eq!(*sink.failures.lock(), vec![id]);
    }

    // ============================================================
    // CANCELLATION & TIMEOUTS
    // ============================================================

    #[test]
    fn test_cancel_pending_get() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");

        let mut fut = cluster.store(2).get(id);
        assert!(cluster.store(2).cancel(&fut));
        assert_eq!(take(&mut fut), Err(CacheError::Cancelled { line: id }));
        assert!(!cluster.store(2).cancel(&fut));

        // The copy still arrives.
        cluster.settle();
        assert_eq!(cluster.line(2, id).state, LineState::Shared);
    }

    #[test]
    fn test_unanswered_request_times_out() {
        let config = GridConfig {
            request_timeout_ms: 0,
            ..GridConfig::default()
        };
        let cluster = TestCluster::new(2, config);
        let id = cluster.put(1, "a");

        let mut fut = cluster.store(2).get_from_owner(id, NodeId(1));
        assert!(cluster.engine(2).expire_requests() >= 1);
        assert_eq!(take(&mut fut), Err(CacheError::Timeout { line: id }));
        assert_eq!(cluster.line(2, id).next_state, None);

        // The late PUT no longer pairs with anything.
        cluster.network.deliver_all();
        assert_eq!(cluster.line(2, id).state, LineState::Invalid);
    }

    // ============================================================
    // MEMBERSHIP
    // ============================================================

    #[test]
    fn test_departed_sharers_are_dropped() {
        let cluster = TestCluster::new(3, GridConfig::default());
        let id = cluster.put(1, "a");
        let mut r2 = cluster.store(2).get(id);
        let mut r3 = cluster.store(3).get(id);
        cluster.settle();
        read(&mut r2);
        read(&mut r3);

        cluster.network.kill(NodeId(3));
        let owner = cluster.line(1, id);
        assert_eq!(owner.state, LineState::Owned);
        assert_eq!(owner.sharers, vec![NodeId(2)]);

        cluster.network.kill(NodeId(2));
        let owner = cluster.line(1, id);
        assert_eq!(owner.state, LineState::Exclusive);
        assert!(owner.sharers.is_empty());
    }

    #[test]
    fn test_locked_line_applies_departure_on_unlock() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");
        let mut r = cluster.store(2).get(id);
        cluster.settle();
        read(&mut r);

        let txn = cluster.store(1).begin_transaction();
        read(&mut cluster.store(1).gets(id, &txn));
        cluster.network.kill(NodeId(2));
        assert_eq!(cluster.line(1, id).sharers, vec![NodeId(2)]);

        cluster.store(1).commit(&txn).unwrap();
        let owner = cluster.line(1, id);
        assert_eq!(owner.state, LineState::Exclusive);
        assert!(owner.sharers.is_empty());
    }

    #[test]
    fn test_lost_owner_without_replacement() {
        let cluster = TestCluster::new(3, GridConfig::default());
        let id = cluster.put(1, "a");
        let mut r = cluster.store(2).get(id);
        cluster.settle();
        read(&mut r);

        cluster.network.kill(NodeId(1));
        let copy = cluster.line(2, id);
        assert_eq!(copy.owner, NodeId::NONE);
        assert_eq!(copy.state, LineState::Shared);

        // Node 3 never saw the line; the lookup comes back empty.
        let mut upgrade = cluster.store(2).getx(id, None);
        cluster.settle();
        assert_eq!(take(&mut upgrade), Err(CacheError::RefNotFound { line: id }));
    }

    #[test]
    fn test_requests_to_departed_node_are_answered_locally() {
        let cluster = TestCluster::new(2, GridConfig::default());
        let id = cluster.put(1, "a");
        cluster.settle();

        let mut fut = cluster.store(2).get_from_owner(id, NodeId(1));
        cluster.network.kill(NodeId(1));
        cluster.settle();

        // Redirected to an unknown owner, then nobody left to ask.
        assert_eq!(take(&mut fut), Err(CacheError::RefNotFound { line: id }));
        assert_eq!(cluster.engine(2).stats().outstanding_requests, 0);
    }
}
