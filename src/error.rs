//! Error types surfaced by the grid.
//!
//! Protocol-level anomalies are absorbed by the engine and turned into protocol
//! continuations. Only conditions a caller can act on travel through these types.

use thiserror::Error;

use crate::cluster::types::NodeId;

/// Errors delivered to the caller of a cache operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheError {
    /// No protocol reply arrived within the configured window.
    #[error("timed out waiting for line {line:#x}")]
    Timeout { line: i64 },

    /// The line was deleted or was never allocated.
    #[error("line {line:#x} not found")]
    RefNotFound { line: i64 },

    /// GETX requested while a shared (GETS) lock is held on the line.
    #[error("cannot upgrade line {line:#x} to exclusive while a shared lock is held")]
    IllegalUpgrade { line: i64 },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("operation on line {line:#x} was cancelled")]
    Cancelled { line: i64 },

    #[error("item of {size} bytes exceeds the maximum of {max}")]
    ItemTooLarge { size: usize, max: usize },

    /// A line function failed or is not registered on the owner.
    #[error("invoke failed: {0}")]
    Invoke(String),

    /// A typed value could not be encoded into or decoded from a line payload.
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors reported by a [`Comm`](crate::cluster::types::Comm) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("node {0} has no known address")]
    NodeNotFound(NodeId),

    #[error("transport closed")]
    Closed,
}

/// Errors raised while decoding a wire frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of frame")]
    UnexpectedEof,

    #[error("unknown message type tag {0}")]
    UnknownType(u8),

    #[error("buffer of {0} bytes does not fit a u16 length prefix")]
    BufferTooLarge(usize),

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("malformed line function blob")]
    InvalidFunction,

    #[error("unknown backup entry kind {0}")]
    UnknownBackupKind(u8),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
