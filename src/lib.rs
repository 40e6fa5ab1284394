//! Coherent Grid Library
//!
//! A replicated in-memory object store. Objects live in *lines* that migrate between
//! nodes under a directory-based cache-coherence protocol, and every dirty line a node
//! owns is mirrored to a standby replica before it is considered safe.
//!
//! ## Architecture Modules
//!
//! - **`cache`**: the coherence engine. Line states, local operations, protocol message
//!   handlers, eviction and node-failure fix-ups.
//! - **`backup`**: replication of dirty lines to the standby slave and the central server.
//! - **`alloc`**: hands out fresh line ids from ranges obtained from a ref allocator.
//! - **`message`**: the protocol messages, their binary codec and request pairing.
//! - **`cluster`**: the membership and transport traits the engine depends on, plus an
//!   in-process implementation.
//! - **`grid`**: the `Store` façade, line functions and the node runtime.

pub mod alloc;
pub mod backup;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod grid;
pub mod message;
