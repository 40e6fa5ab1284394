//! Membership changes and the standby replica.
//!
//! When a node leaves, every line that names it as owner or sharer is patched and every
//! request addressed to it gets the answer the node would have given. Lines that are
//! locked at that moment keep the change queued and apply it when they unlock.

use super::engine::{Ctx, Engine, NodeEvent, unreachable_reply};
use super::line::{Line, LineFlags, LineState};
use super::listener::LineEvent;
use crate::cluster::types::{NodeChangeListener, NodeId};
use crate::error::{CacheError, CacheResult};
use crate::backup::engine::backup_entry;
use crate::message::types::{BackupData, BackupEntry};

impl Engine {
    fn node_gone(&self, node: NodeId, event: NodeEvent) {
        let mut ctx = Ctx::default();

        let (orphaned, exhausted) = self.tracker.node_gone(node);
        for request in orphaned {
            match unreachable_reply(&request) {
                Some(reply) => ctx.defer(reply),
                None => self.undeliverable(&mut ctx, &request, false),
            }
        }
        for reply in exhausted {
            ctx.defer(reply);
        }
        self.owner_clocks.remove(&node);

        for id in self.lines.all_ids() {
            let Some(mut line) = self.lock_line(id, false) else {
                continue;
            };
            if line.owner != node && !line.sharers.contains(&node) {
                continue;
            }
            if line.is_locked() {
                self.node_events.entry(id).or_default().push(event);
                continue;
            }
            self.fix_line(&mut ctx, &mut line, event);
            self.after_line_change(&mut ctx, &mut line);
        }
        self.drain(&mut ctx);
    }

    /// Applies membership changes queued while the line was locked.
    pub(crate) fn apply_node_events(&self, ctx: &mut Ctx, line: &mut Line) {
        if line.is_locked() {
            return;
        }
        let Some((_, events)) = self.node_events.remove(&line.id) else {
            return;
        };
        for event in events {
            self.fix_line(ctx, line, event);
        }
    }

    fn fix_line(&self, ctx: &mut Ctx, line: &mut Line, event: NodeEvent) {
        let node = match event {
            NodeEvent::Removed(node) => {
                if line.owner == node {
                    line.owner = if self.has_server() {
                        NodeId::SERVER
                    } else {
                        NodeId::NONE
                    };
                }
                node
            }
            NodeEvent::Switched(node) => {
                // The promoted slave never learned who shares its lines.
                if line.owner == node && line.state == LineState::Shared {
                    line.transition(LineState::Invalid);
                    ctx.event(line, LineEvent::Invalidated { line: line.id });
                }
                node
            }
        };
        if line.sharers.remove(&node) && line.state == LineState::Owned && line.sharers.is_empty() {
            line.set(LineFlags::INCOMPLETE, false);
            line.transition(LineState::Exclusive);
        }
        tracing::debug!("Line {:#x} adjusted after {:?}", line.id, event);
    }

    // ============================================================
    // REPLICATION
    // ============================================================

    /// Starts replicating every owned line to a newly attached slave.
    pub fn on_slave_joined(&self) {
        let mut ctx = Ctx::default();
        let mut marked = 0;
        for id in self.lines.owned_ids() {
            let Some(mut line) = self.lock_line(id, false) else {
                continue;
            };
            if !line.state.is_owner() {
                continue;
            }
            line.set(LineFlags::MODIFIED, true);
            line.set(LineFlags::SLAVE, false);
            marked += 1;
            self.after_line_change(&mut ctx, &mut line);
        }
        self.backup.start_replication();
        tracing::info!("Slave joined; replicating {} lines", marked);
        self.drain(&mut ctx);
    }

    /// Promotes this standby replica. Fails until the master's initial replication has
    /// completed.
    pub fn switch_to_master(&self) -> CacheResult<()> {
        if !self.backup.is_replica_ready() {
            return Err(CacheError::IllegalState(
                "replica has not received the complete line set".to_string(),
            ));
        }
        let me = self.me();
        let mut ctx = Ctx::default();
        let mut promoted = 0;
        for id in self.lines.shared_ids() {
            let Some(mut line) = self.lock_line(id, false) else {
                continue;
            };
            if line.owner != me || line.state != LineState::Shared {
                continue;
            }
            line.sharers.clear();
            line.transition(LineState::Exclusive);
            line.set(LineFlags::MODIFIED, false);
            promoted += 1;
            self.after_line_change(&mut ctx, &mut line);
        }
        self.drain(&mut ctx);
        tracing::info!("{} switched to master with {} lines", me, promoted);
        Ok(())
    }

    /// Installs one line received from the master.
    pub(crate) fn apply_backup(&self, ctx: &mut Ctx, entry: &BackupEntry) {
        let Some(mut line) = self.lock_line(entry.line, true) else {
            return;
        };
        if entry.version < line.version {
            return;
        }
        line.version = entry.version;
        let data = match &entry.data {
            BackupData::Data(bytes) => Some(self.copy_in(bytes)),
            BackupData::Empty | BackupData::Deleted => None,
        };
        self.replace_data(&mut line, data);
        line.set(LineFlags::DELETED, entry.data == BackupData::Deleted);
        line.owner = self.me();
        line.transition(LineState::Shared);
        self.after_line_change(ctx, &mut line);
    }

    /// Copies a dirty line for a backup packet. `None` when it no longer needs one or is
    /// locked (it is queued again on unlock).
    pub(crate) fn backup_snapshot(&self, id: i64, expected_version: u64) -> Option<BackupEntry> {
        let line = self.lock_line(id, false)?;
        if !line.state.is_owner() || !line.is(LineFlags::MODIFIED) || line.is_locked() {
            return None;
        }
        if line.version != expected_version {
            self.backup.version_mismatch(id, expected_version, line.version);
        }
        Some(backup_entry(&line))
    }

    /// Clears MODIFIED on lines whose backed-up version is still current.
    pub(crate) fn backups_acked(&self, ctx: &mut Ctx, backups: &[BackupEntry], on_slave: bool) {
        for entry in backups {
            let Some(mut line) = self.lock_line(entry.line, false) else {
                continue;
            };
            if line.version == entry.version {
                line.set(LineFlags::MODIFIED, false);
                if on_slave {
                    line.set(LineFlags::SLAVE, true);
                }
            }
            self.after_line_change(ctx, &mut line);
        }
    }

    /// True while some owned line still waits for its backup.
    pub(crate) fn has_unreplicated_lines(&self) -> bool {
        self.lines.owned_ids().into_iter().any(|id| {
            self.lines
                .get(id)
                .is_some_and(|cell| cell.lock().is(LineFlags::MODIFIED))
        })
    }
}

impl NodeChangeListener for Engine {
    fn node_added(&self, node: NodeId) {
        if node == self.me() {
            if self.cluster.is_master() {
                self.on_slave_joined();
            }
            return;
        }
        tracing::info!("{} joined", node);
    }

    fn node_removed(&self, node: NodeId) {
        tracing::info!("{} left the cluster", node);
        self.node_gone(node, NodeEvent::Removed(node));
    }

    fn node_switched(&self, node: NodeId) {
        if node == self.me() {
            if self.cluster.is_master()
                && let Err(e) = self.switch_to_master()
            {
                tracing::error!("Promotion of {} failed: {}", node, e);
            }
            return;
        }
        tracing::info!("{} failed over to its slave", node);
        self.node_gone(node, NodeEvent::Switched(node));
    }
}
