//! Cluster Collaborators
//!
//! The coherence engine does not own membership or transport. It talks to the rest of the
//! cluster through a handful of traits:
//!
//! - **`Cluster`**: who am I, am I a master, is there a server or a standby slave.
//! - **`Comm`**: node-addressed unicast, broadcast, and delivery to this node's slaves.
//! - **`MessageReceiver`** / **`NodeChangeListener`**: the callbacks the engine exposes.
//!
//! `local` provides an in-process implementation used by the demo binary and the tests.

pub mod local;
pub mod types;

#[cfg(test)]
mod tests;
