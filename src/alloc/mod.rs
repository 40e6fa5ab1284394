//! Id Allocation
//!
//! New lines get their ids from a per-node window that is refilled in batches, either
//! from the central server (ALLOC_REF / ALLOCED_REF) or from a [`refs::RefAllocator`].

pub mod allocator;
pub mod refs;
