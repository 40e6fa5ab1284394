//! Backup & Replication
//!
//! A master mirrors every dirty line it owns to its standby slave and, when one exists, to
//! the central server. Dirty lines are collected between flushes and shipped as one
//! BACKUP_PACKET; a line stays MODIFIED until every target acknowledged the packet that
//! carried its current version. At most one packet is in flight at a time.
//!
//! On the slave side the same engine applies received packets and records when the
//! initial replication is complete, which is what makes the slave eligible for promotion.

pub mod engine;

#[cfg(test)]
mod tests;
