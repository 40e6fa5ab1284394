//! Grid Node
//!
//! Wires one engine to its transport and runs the periodic work the engine does not do on
//! its own: flushing backups and expiring requests that never got an answer.

use std::sync::Arc;
use std::time::Duration;

use super::registry::InvokeRegistry;
use super::store::Store;
use crate::cache::engine::Engine;
use crate::cluster::local::{LocalEndpoint, LocalNetwork};
use crate::cluster::types::{NodeId, NodeRole};
use crate::config::GridConfig;

/// How often outstanding requests are checked against the timeout.
const EXPIRE_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

pub struct GridNode {
    engine: Arc<Engine>,
    store: Store,
    endpoint: Arc<LocalEndpoint>,
}

impl GridNode {
    /// Builds a node on an in-process network and attaches it.
    pub fn local(
        network: &Arc<LocalNetwork>,
        node: NodeId,
        role: NodeRole,
        config: GridConfig,
        functions: Arc<InvokeRegistry>,
    ) -> Arc<Self> {
        let endpoint = network.endpoint(node, role);
        let engine = Engine::builder(config, endpoint.clone(), endpoint.clone())
            .functions(functions)
            .ref_allocator(Arc::new(network.ref_allocator()))
            .build();
        network.attach(endpoint.clone(), engine.clone(), Some(engine.clone()));

        Arc::new(Self {
            store: Store::new(engine.clone()),
            engine,
            endpoint,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn role(&self) -> NodeRole {
        self.endpoint.role()
    }

    /// Spawns the backup flush and request expiry loops and returns immediately.
    pub async fn start(self: Arc<Self>) {
        let interval = self.engine.config().backup_interval();
        tracing::info!(
            "Starting {} as {:?} (backup every {:?})",
            self.engine.me(),
            self.role(),
            interval
        );

        let node = self.clone();
        tokio::spawn(async move {
            node.backup_loop(interval).await;
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.expire_loop().await;
        });
    }

    async fn backup_loop(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if self.engine.flush_backups() {
                tracing::trace!("{} flushed a backup packet", self.engine.me());
            }
        }
    }

    async fn expire_loop(&self) {
        let mut ticker = tokio::time::interval(EXPIRE_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let expired = self.engine.expire_requests();
            if expired > 0 {
                tracing::warn!("{} expired {} requests", self.engine.me(), expired);
            }
        }
    }
}
