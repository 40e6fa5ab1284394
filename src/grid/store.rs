//! Store Façade
//!
//! The application's view of the grid. Every call maps onto one engine operation and
//! returns its [`OpFuture`]: await it, or block on it with `wait()` from a plain thread.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::cache::engine::{Engine, EngineStats};
use crate::cache::listener::CacheListener;
use crate::cache::op::{Op, OpFuture, OpKind};
use crate::cache::transaction::Transaction;
use crate::cluster::types::NodeId;
use crate::error::{CacheError, CacheResult};
use crate::message::types::LineFunction;

#[derive(Clone)]
pub struct Store {
    engine: Arc<Engine>,
}

impl Store {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn me(&self) -> NodeId {
        self.engine.me()
    }

    fn submit(&self, line: i64, kind: OpKind, txn: Option<&Transaction>, hint: NodeId) -> OpFuture {
        self.engine
            .submit(Op::new(line, kind).with_hint(hint).in_txn(txn))
    }

    // ============================================================
    // READS
    // ============================================================

    /// Reads the line, fetching a shared copy if this node has none.
    pub fn get(&self, id: i64) -> OpFuture {
        self.submit(id, OpKind::Get, None, NodeId::NONE)
    }

    /// Like [`get`](Self::get), asking `owner` first when the owner is unknown.
    pub fn get_from_owner(&self, id: i64, owner: NodeId) -> OpFuture {
        self.submit(id, OpKind::Get, None, owner)
    }

    /// Reads the line and holds a shared lock on it until the transaction ends.
    pub fn gets(&self, id: i64, txn: &Transaction) -> OpFuture {
        self.submit(id, OpKind::Gets, Some(txn), NodeId::NONE)
    }

    /// Takes exclusive ownership. Inside a transaction the line stays locked until it ends.
    pub fn getx(&self, id: i64, txn: Option<&Transaction>) -> OpFuture {
        self.submit(id, OpKind::Getx, txn, NodeId::NONE)
    }

    pub fn getx_from_owner(&self, id: i64, owner: NodeId, txn: Option<&Transaction>) -> OpFuture {
        self.submit(id, OpKind::Getx, txn, owner)
    }

    /// Reads and decodes a value written with [`set_as`](Self::set_as).
    pub async fn get_as<T: DeserializeOwned>(&self, id: i64) -> CacheResult<Option<T>> {
        let Some(bytes) = self.get(id).await?.into_data() else {
            return Ok(None);
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    // ============================================================
    // WRITES
    // ============================================================

    pub fn set(&self, id: i64, data: impl Into<Bytes>, txn: Option<&Transaction>) -> OpFuture {
        self.submit(id, OpKind::Set(data.into()), txn, NodeId::NONE)
    }

    pub fn set_as<T: Serialize>(&self, id: i64, value: &T, txn: Option<&Transaction>) -> OpFuture {
        match bincode::serialize(value) {
            Ok(encoded) => self.set(id, encoded, txn),
            Err(e) => OpFuture::ready(id, Err(CacheError::Serialization(e.to_string()))),
        }
    }

    pub fn del(&self, id: i64, txn: Option<&Transaction>) -> OpFuture {
        self.submit(id, OpKind::Del, txn, NodeId::NONE)
    }

    /// Allocates a new line holding `data`; resolves to its id.
    pub fn put(&self, data: impl Into<Bytes>, txn: Option<&Transaction>) -> OpFuture {
        self.submit(-1, OpKind::Put(data.into()), txn, NodeId::NONE)
    }

    /// Allocates `count` consecutive empty lines; resolves to the first id.
    pub fn alloc(&self, count: u32, txn: Option<&Transaction>) -> OpFuture {
        self.submit(-1, OpKind::Alloc(count), txn, NodeId::NONE)
    }

    // ============================================================
    // OWNER-DIRECTED
    // ============================================================

    /// Delivers `data` to the listener of the line on its owner.
    pub fn send(&self, id: i64, data: impl Into<Bytes>) -> OpFuture {
        self.submit(id, OpKind::Send(data.into()), None, NodeId::NONE)
    }

    /// Runs a registered line function on the owner.
    pub fn invoke(&self, id: i64, function: LineFunction, txn: Option<&Transaction>) -> OpFuture {
        self.submit(id, OpKind::Invoke(function), txn, NodeId::NONE)
    }

    /// Sends the current version to `nodes` as sharers. A no-op unless this node owns
    /// the line.
    pub fn push(&self, id: i64, nodes: Vec<NodeId>) -> OpFuture {
        self.submit(id, OpKind::Push(nodes), None, NodeId::NONE)
    }

    /// Hands ownership to `node` once the line is backed up and unlocked.
    pub fn pushx(&self, id: i64, node: NodeId) -> OpFuture {
        self.submit(id, OpKind::Pushx(node), None, NodeId::NONE)
    }

    // ============================================================
    // LISTENERS, CANCELLATION, TRANSACTIONS
    // ============================================================

    pub fn set_listener(&self, id: i64, listener: Option<Arc<dyn CacheListener>>) -> OpFuture {
        self.submit(id, OpKind::Listen(listener), None, NodeId::NONE)
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.engine.add_listener(listener);
    }

    /// Cancels an operation that has not completed yet.
    pub fn cancel(&self, future: &OpFuture) -> bool {
        self.engine.cancel(future.line(), future.op_id())
    }

    pub fn begin_transaction(&self) -> Transaction {
        self.engine.begin_transaction()
    }

    pub fn commit(&self, txn: &Transaction) -> CacheResult<()> {
        self.engine.end_transaction(txn, true)
    }

    pub fn rollback(&self, txn: &Transaction) -> CacheResult<()> {
        self.engine.end_transaction(txn, false)
    }

    pub fn max_item_size(&self) -> usize {
        self.engine.config().max_item_size
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }
}
