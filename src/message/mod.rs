//! Protocol Messages
//!
//! Messages are a tagged union (`MessageBody`) wrapped with the common header fields
//! (peer node, message id, flags).
//!
//! - **`types`**: the message kinds and their fields.
//! - **`codec`**: the compact binary wire format.
//! - **`tracker`**: pairing of responses with outstanding requests, broadcast ACK
//!   collection and request timeouts.

pub mod codec;
pub mod tracker;
pub mod types;
