//! Coherence Cache
//!
//! Every object in the grid is a *line*: a payload plus the protocol state this node keeps
//! for it. Lines move between nodes under a MOESI-like directory protocol.
//!
//! - **`line`**: the line record, its states and flags.
//! - **`store`**: the owned and shared pools, with CLOCK eviction of shared copies.
//! - **`op`** / **`ops`**: local operations and how each one drives its line.
//! - **`handlers`**: inbound protocol messages.
//! - **`membership`**: node failure fix-ups and standby promotion.
//! - **`engine`**: the coherence engine tying these together.
//! - **`transaction`**, **`listener`**, **`storage`**: transactions, line events and
//!   payload storage accounting.

pub mod engine;
pub mod handlers;
pub mod line;
pub mod listener;
pub mod membership;
pub mod op;
pub mod ops;
pub mod storage;
pub mod store;
pub mod transaction;

#[cfg(test)]
mod tests;
