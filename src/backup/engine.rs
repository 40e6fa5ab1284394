use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::cache::engine::{Ctx, Engine};
use crate::cache::line::{Line, LineFlags};
use crate::cluster::types::NodeId;
use crate::message::types::{
    BackupData, BackupEntry, Message, MessageBody, REPLICATION_COMPLETE_MARKER,
};

/// Node property a slave sets once it holds the complete line set.
pub const REPLICA_READY_PROPERTY: &str = "replica_ready";

/// The packet waiting for acknowledgements.
#[derive(Debug)]
struct InFlight {
    packet_id: i64,
    backups: Vec<BackupEntry>,
    await_server: bool,
    await_slaves: bool,
    sent_to_slaves: bool,
    sent_at: Instant,
    warned: bool,
}

impl InFlight {
    fn is_done(&self) -> bool {
        !self.await_server && !self.await_slaves
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replication {
    Idle,
    /// A slave joined; the marker goes out once every owned line is backed up.
    Pending,
    MarkerSent,
}

pub struct BackupEngine {
    /// Dirty line id -> version, double buffered so writers never wait on a flush.
    maps: [DashMap<i64, u64>; 2],
    active: AtomicUsize,
    /// Set when a line moved on between enqueue and flush; while set, entries are copied
    /// as they are enqueued. Cleared by the next flush that finds no such line.
    copy_immediately: AtomicBool,
    /// A mismatch was seen by the flush collecting right now.
    mismatch_in_flush: AtomicBool,
    copied: Mutex<HashMap<i64, BackupEntry>>,
    flight: Mutex<Option<InFlight>>,
    flushing: Mutex<()>,
    next_packet_id: AtomicI64,
    replication: Mutex<Replication>,
    replica_ready: AtomicBool,
    warn_after: Duration,
}

impl BackupEngine {
    pub fn new(warn_after: Duration) -> Self {
        Self {
            maps: [DashMap::new(), DashMap::new()],
            active: AtomicUsize::new(0),
            copy_immediately: AtomicBool::new(false),
            mismatch_in_flush: AtomicBool::new(false),
            copied: Mutex::new(HashMap::new()),
            flight: Mutex::new(None),
            flushing: Mutex::new(()),
            next_packet_id: AtomicI64::new(1),
            replication: Mutex::new(Replication::Idle),
            replica_ready: AtomicBool::new(false),
            warn_after,
        }
    }

    /// Marks a dirty owned line for the next flush. Called with the line locked.
    pub(crate) fn enqueue(&self, line: &Line) {
        if self.copy_immediately.load(Ordering::Relaxed) {
            self.copied.lock().insert(line.id, backup_entry(line));
            return;
        }
        let active = self.active.load(Ordering::Acquire);
        self.maps[active].insert(line.id, line.version);
    }

    pub(crate) fn version_mismatch(&self, line: i64, expected: u64, actual: u64) {
        self.mismatch_in_flush.store(true, Ordering::Relaxed);
        if !self.copy_immediately.swap(true, Ordering::Relaxed) {
            tracing::debug!(
                "Line {:#x} moved from version {} to {} before its backup; copying on enqueue",
                line,
                expected,
                actual
            );
        }
    }

    pub fn pending(&self) -> usize {
        self.maps[0].len() + self.maps[1].len() + self.copied.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn copies_on_enqueue(&self) -> bool {
        self.copy_immediately.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> bool {
        self.flight.lock().is_some()
    }

    /// Whether the packet waiting for acknowledgement carries `line`.
    pub(crate) fn in_flight_contains(&self, line: i64) -> bool {
        self.flight
            .lock()
            .as_ref()
            .is_some_and(|f| f.backups.iter().any(|b| b.line == line))
    }

    pub fn is_replica_ready(&self) -> bool {
        self.replica_ready.load(Ordering::Acquire)
    }

    // ============================================================
    // MASTER SIDE
    // ============================================================

    /// Ships every pending backup in one packet. Returns true if a packet was sent, or
    /// acknowledged locally because there is nobody to send it to.
    pub fn flush(&self, engine: &Engine) -> bool {
        if !engine.cluster.is_master() {
            return false;
        }
        let Some(guard) = self.flushing.try_lock() else {
            return false;
        };
        if self.check_overdue() {
            return false;
        }

        let mut ctx = Ctx::default();
        let backups = self.collect(engine);
        if backups.is_empty() {
            self.maybe_finish_replication(engine, &mut ctx);
            drop(guard);
            engine.drain(&mut ctx);
            return false;
        }

        let to_server = engine.has_server();
        let to_slaves = engine.cluster.has_slaves();
        if !to_server && !to_slaves {
            engine.backups_acked(&mut ctx, &backups, false);
            drop(guard);
            engine.drain(&mut ctx);
            return true;
        }

        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Backup packet #{} with {} lines (server: {}, slaves: {})",
            packet_id,
            backups.len(),
            to_server,
            to_slaves
        );
        let body = MessageBody::BackupPacket {
            packet_id,
            backups: backups.clone(),
        };
        *self.flight.lock() = Some(InFlight {
            packet_id,
            backups,
            await_server: to_server,
            await_slaves: to_slaves,
            sent_to_slaves: to_slaves,
            sent_at: Instant::now(),
            warned: false,
        });
        if to_server {
            engine.send(&mut ctx, Message::to(NodeId::SERVER, body.clone()));
        }
        if to_slaves {
            engine.send_to_slaves(&mut ctx, Message::to(engine.me(), body));
        }
        drop(guard);
        engine.drain(&mut ctx);
        true
    }

    /// True while a packet is still unacknowledged; warns once when it is overdue.
    fn check_overdue(&self) -> bool {
        let mut flight = self.flight.lock();
        let Some(flight) = flight.as_mut() else {
            return false;
        };
        if !flight.warned && flight.sent_at.elapsed() > self.warn_after {
            flight.warned = true;
            tracing::warn!(
                "Backup packet #{} unacknowledged after {:?} (server: {}, slaves: {})",
                flight.packet_id,
                flight.sent_at.elapsed(),
                flight.await_server,
                flight.await_slaves
            );
        }
        true
    }

    /// Swaps the dirty map and snapshots the lines it names.
    fn collect(&self, engine: &Engine) -> Vec<BackupEntry> {
        let drained = self.active.fetch_xor(1, Ordering::AcqRel);
        let ids: Vec<i64> = self.maps[drained].iter().map(|e| *e.key()).collect();
        self.mismatch_in_flush.store(false, Ordering::Relaxed);

        let mut entries: HashMap<i64, BackupEntry> = HashMap::new();
        for id in ids {
            let Some((_, version)) = self.maps[drained].remove(&id) else {
                continue;
            };
            if let Some(entry) = engine.backup_snapshot(id, version) {
                entries.insert(id, entry);
            }
        }
        if !self.mismatch_in_flush.load(Ordering::Relaxed)
            && self.copy_immediately.swap(false, Ordering::Relaxed)
        {
            tracing::debug!("No line moved during this flush; batching enqueues again");
        }
        for (id, entry) in self.copied.lock().drain() {
            match entries.get(&id) {
                Some(existing) if existing.version >= entry.version => {}
                _ => {
                    entries.insert(id, entry);
                }
            }
        }

        let mut backups: Vec<BackupEntry> = entries.into_values().collect();
        backups.sort_by_key(|b| b.line);
        backups
    }

    pub(crate) fn on_ack(&self, engine: &Engine, ctx: &mut Ctx, msg: &Message) {
        match &msg.body {
            MessageBody::BackupPacketAck { packet_id } => {
                let from_server = msg.node.is_server();
                self.target_done(engine, ctx, *packet_id, !from_server);
            }
            MessageBody::BackupAck { line, .. } if *line == REPLICATION_COMPLETE_MARKER => {
                let mut replication = self.replication.lock();
                if *replication == Replication::MarkerSent {
                    *replication = Replication::Idle;
                    tracing::info!("Slave of {} holds the complete line set", engine.me());
                }
            }
            _ => {}
        }
    }

    /// The transport could not reach a target; it no longer holds up the packet.
    pub(crate) fn target_lost(&self, engine: &Engine, ctx: &mut Ctx, packet_id: i64, to_slaves: bool) {
        tracing::warn!(
            "Backup packet #{} target lost ({})",
            packet_id,
            if to_slaves { "slaves" } else { "server" }
        );
        self.target_done(engine, ctx, packet_id, to_slaves);
    }

    fn target_done(&self, engine: &Engine, ctx: &mut Ctx, packet_id: i64, slaves: bool) {
        let finished = {
            let mut flight = self.flight.lock();
            let Some(current) = flight.as_mut() else {
                return;
            };
            if current.packet_id != packet_id {
                return;
            }
            if slaves {
                current.await_slaves = false;
            } else {
                current.await_server = false;
            }
            if !current.is_done() {
                return;
            }
            flight.take()
        };
        let Some(done) = finished else {
            return;
        };
        tracing::trace!("Backup packet #{} acknowledged", done.packet_id);
        engine.backups_acked(ctx, &done.backups, done.sent_to_slaves);
        self.maybe_finish_replication(engine, ctx);
    }

    /// Resends a backup request that got no answer in time.
    pub(crate) fn request_expired(&self, engine: &Engine, ctx: &mut Ctx, request: Message) {
        match &request.body {
            MessageBody::BackupPacket { packet_id, backups } => {
                let to_slaves = !request.node.is_server();
                let still_waiting = self.flight.lock().as_ref().is_some_and(|f| {
                    f.packet_id == *packet_id
                        && if to_slaves {
                            f.await_slaves
                        } else {
                            f.await_server
                        }
                });
                if !still_waiting {
                    return;
                }
                let body = MessageBody::BackupPacket {
                    packet_id: *packet_id,
                    backups: backups.clone(),
                };
                if to_slaves {
                    engine.send_to_slaves(ctx, Message::to(engine.me(), body));
                } else {
                    engine.send(ctx, Message::to(NodeId::SERVER, body));
                }
            }
            MessageBody::Backup(entry) if entry.line == REPLICATION_COMPLETE_MARKER => {
                if *self.replication.lock() == Replication::MarkerSent {
                    engine.send_to_slaves(ctx, marker());
                }
            }
            _ => {}
        }
    }

    /// A slave joined: the marker follows once every owned line has been replicated.
    pub(crate) fn start_replication(&self) {
        *self.replication.lock() = Replication::Pending;
    }

    fn maybe_finish_replication(&self, engine: &Engine, ctx: &mut Ctx) {
        if *self.replication.lock() != Replication::Pending {
            return;
        }
        if self.in_flight() || self.pending() > 0 || engine.has_unreplicated_lines() {
            return;
        }
        if !engine.cluster.has_slaves() {
            *self.replication.lock() = Replication::Idle;
            return;
        }
        *self.replication.lock() = Replication::MarkerSent;
        tracing::debug!("Initial replication of {} complete, sending marker", engine.me());
        engine.send_to_slaves(ctx, marker());
    }

    // ============================================================
    // SLAVE SIDE
    // ============================================================

    pub(crate) fn receive(&self, engine: &Engine, ctx: &mut Ctx, msg: &Message) {
        if engine.cluster.is_master() {
            tracing::warn!("Master {} ignoring {:?} from {}", engine.me(), msg.message_type(), msg.node);
            return;
        }
        match &msg.body {
            MessageBody::BackupPacket { packet_id, backups } => {
                for entry in backups {
                    engine.apply_backup(ctx, entry);
                }
                tracing::trace!("Applied backup packet #{} ({} lines)", packet_id, backups.len());
                engine.reply(ctx, msg, MessageBody::BackupPacketAck { packet_id: *packet_id });
            }
            MessageBody::Backup(entry) => {
                if entry.line == REPLICATION_COMPLETE_MARKER {
                    self.replica_ready.store(true, Ordering::Release);
                    engine.cluster.set_property(REPLICA_READY_PROPERTY, "true");
                    tracing::info!("Replica of {} is ready", engine.me());
                } else {
                    engine.apply_backup(ctx, entry);
                }
                engine.reply(
                    ctx,
                    msg,
                    MessageBody::BackupAck {
                        line: entry.line,
                        version: entry.version,
                    },
                );
            }
            _ => {}
        }
    }
}

pub(crate) fn backup_entry(line: &Line) -> BackupEntry {
    BackupEntry {
        line: line.id,
        version: line.version,
        data: BackupData::from_payload(line.data.as_ref(), line.is(LineFlags::DELETED)),
    }
}

fn marker() -> Message {
    Message::to(
        NodeId::NONE,
        MessageBody::Backup(BackupEntry {
            line: REPLICATION_COMPLETE_MARKER,
            version: 0,
            data: BackupData::Empty,
        }),
    )
}
