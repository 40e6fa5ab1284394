//! Cache operations and their completion handles.

use bytes::Bytes;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use super::listener::CacheListener;
use super::transaction::Transaction;
use crate::cluster::types::NodeId;
use crate::error::{CacheError, CacheResult};
use crate::message::types::LineFunction;

/// What an operation does. Payload-carrying kinds own their payload.
#[derive(Clone)]
pub enum OpKind {
    Get,
    /// Read and take a shared lock in the enclosing transaction.
    Gets,
    /// Acquire exclusive ownership and take the write lock.
    Getx,
    Set(Bytes),
    Del,
    /// Allocate one fresh line holding the payload.
    Put(Bytes),
    /// Allocate `n` consecutive empty lines.
    Alloc(u32),
    Send(Bytes),
    /// Share the current version with these nodes.
    Push(Vec<NodeId>),
    /// Hand ownership to this node.
    Pushx(NodeId),
    Invoke(LineFunction),
    Listen(Option<Arc<dyn CacheListener>>),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Get => "GET",
            OpKind::Gets => "GETS",
            OpKind::Getx => "GETX",
            OpKind::Set(_) => "SET",
            OpKind::Del => "DEL",
            OpKind::Put(_) => "PUT",
            OpKind::Alloc(_) => "ALLOC",
            OpKind::Send(_) => "SEND",
            OpKind::Push(_) => "PUSH",
            OpKind::Pushx(_) => "PUSHX",
            OpKind::Invoke(_) => "INVOKE",
            OpKind::Listen(_) => "LSTN",
        }
    }

    /// Allocation kinds run against the id allocator, not an existing line.
    pub fn is_allocation(&self) -> bool {
        matches!(self, OpKind::Put(_) | OpKind::Alloc(_))
    }
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Set(data) | OpKind::Put(data) | OpKind::Send(data) => {
                write!(f, "{}({} bytes)", self.name(), data.len())
            }
            OpKind::Alloc(n) => write!(f, "ALLOC({})", n),
            OpKind::Push(nodes) => write!(f, "PUSH({:?})", nodes),
            OpKind::Pushx(node) => write!(f, "PUSHX({})", node),
            OpKind::Invoke(function) => write!(f, "INVOKE({})", function.name),
            _ => f.write_str(self.name()),
        }
    }
}

/// One request against the cache.
#[derive(Debug, Clone)]
pub struct Op {
    pub id: u64,
    pub line: i64,
    pub kind: OpKind,
    /// Where to look for the owner when it is unknown.
    pub hint: NodeId,
    pub txn: Option<Transaction>,
    /// Message id of the request this op is waiting on, for kinds that ship work to the
    /// owner (SEND, INVOKE).
    pub(crate) awaiting: Option<i64>,
}

impl Op {
    pub fn new(line: i64, kind: OpKind) -> Self {
        Self {
            id: 0,
            line,
            kind,
            hint: NodeId::NONE,
            txn: None,
            awaiting: None,
        }
    }

    pub fn with_hint(mut self, hint: NodeId) -> Self {
        self.hint = hint;
        self
    }

    pub fn in_txn(mut self, txn: Option<&Transaction>) -> Self {
        self.txn = txn.cloned();
        self
    }

    pub(crate) fn txn_id(&self) -> Option<u64> {
        self.txn.as_ref().map(|t| t.id())
    }
}

/// Result of a completed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpValue {
    None,
    Data(Option<Bytes>),
    /// First id handed out by PUT or ALLOC.
    Id(i64),
    Invoked(Option<Bytes>),
}

impl OpValue {
    pub fn into_data(self) -> Option<Bytes> {
        match self {
            OpValue::Data(data) | OpValue::Invoked(data) => data,
            _ => None,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            OpValue::Id(id) => Some(*id),
            _ => None,
        }
    }
}

/// An operation parked until protocol progress lets it complete.
pub(crate) struct PendingOp {
    pub op: Op,
    reply: oneshot::Sender<CacheResult<OpValue>>,
}

impl PendingOp {
    pub fn new(op: Op) -> (Self, OpFuture) {
        let (tx, rx) = oneshot::channel();
        let future = OpFuture {
            line: op.line,
            op_id: op.id,
            rx,
        };
        (Self { op, reply: tx }, future)
    }

    pub fn complete(self, result: CacheResult<OpValue>) {
        if let Err(e) = &result {
            tracing::debug!("{:?} on line {:#x} failed: {}", self.op.kind, self.op.line, e);
        }
        // The caller may have dropped its future; nothing to do then.
        let _ = self.reply.send(result);
    }

    /// True once the caller dropped its future.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as delivering inbound messages until dropped.
pub(crate) struct DispatchScope {
    outer: bool,
}

impl DispatchScope {
    pub(crate) fn enter() -> Self {
        Self {
            outer: DISPATCHING.replace(true),
        }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.set(self.outer);
    }
}

/// Completion handle returned by every cache operation.
///
/// Await it from async code, poll it with [`try_take`](Self::try_take), or block on it
/// with [`wait`](Self::wait) from a plain thread.
#[derive(Debug)]
pub struct OpFuture {
    line: i64,
    op_id: u64,
    rx: oneshot::Receiver<CacheResult<OpValue>>,
}

impl OpFuture {
    /// An already completed handle.
    pub fn ready(line: i64, result: CacheResult<OpValue>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { line, op_id: 0, rx }
    }

    pub fn line(&self) -> i64 {
        self.line
    }

    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    /// Takes the result if the operation has completed.
    pub fn try_take(&mut self) -> Option<CacheResult<OpValue>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(CacheError::Cancelled { line: self.line }))
            }
        }
    }

    /// Blocks the calling thread until the operation completes.
    ///
    /// Refused while the thread is delivering messages to an engine (a listener callback,
    /// for instance), since the reply would have to arrive on that same thread. Also
    /// refused on any thread inside a tokio runtime context, `spawn_blocking` threads
    /// included; there, use `Handle::current().block_on(future)` or await the future.
    pub fn wait(self) -> CacheResult<OpValue> {
        if DISPATCHING.get() {
            return Err(CacheError::IllegalState(
                "blocking wait called while dispatching messages".to_string(),
            ));
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(CacheError::IllegalState(
                "blocking wait called from an async runtime thread".to_string(),
            ));
        }
        let line = self.line;
        self.rx
            .blocking_recv()
            .unwrap_or(Err(CacheError::Cancelled { line }))
    }
}

impl Future for OpFuture {
    type Output = CacheResult<OpValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let line = self.line;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CacheError::Cancelled { line })))
    }
}
