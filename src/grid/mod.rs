//! Grid Façade
//!
//! What an application links against:
//!
//! - **`store`**: `Store`, the get/set/put/invoke/transaction API over one engine.
//! - **`registry`**: named line functions that INVOKE runs on a line's owner.
//! - **`node`**: `GridNode`, an engine wired to a transport with its periodic loops.

pub mod node;
pub mod registry;
pub mod store;
