//! Grid configuration.
//!
//! Every field has a default so a partial JSON document or a sparse environment is enough
//! to build a node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::message::codec::MAX_BUFFER_LEN;

pub const DEFAULT_MAX_ITEM_SIZE: usize = 1024;
pub const DEFAULT_MAX_SHARED_LINES: usize = 100_000;
pub const DEFAULT_BACKUP_INTERVAL_MS: u64 = 10;
pub const DEFAULT_SLAVE_ACK_WARN_MS: u64 = 2_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_ALLOC_BATCH_SIZE: u32 = 10_000;

const ENV_PREFIX: &str = "GRID_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    /// Largest payload a single line may hold.
    pub max_item_size: usize,
    /// Capacity of the shared (S/I) pool before eviction kicks in.
    pub max_shared_lines: usize,
    pub backup_interval_ms: u64,
    /// Unacknowledged backup packets older than this are reported.
    pub slave_ack_warn_ms: u64,
    pub request_timeout_ms: u64,
    /// How long an invalidated copy may still be served locally. Zero disables stale reads.
    pub max_stale_read_ms: u64,
    pub rollback_enabled: bool,
    pub alloc_batch_size: u32,
    /// A central server (node 0) takes part in lookups and backups.
    pub has_server: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
            max_shared_lines: DEFAULT_MAX_SHARED_LINES,
            backup_interval_ms: DEFAULT_BACKUP_INTERVAL_MS,
            slave_ack_warn_ms: DEFAULT_SLAVE_ACK_WARN_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_stale_read_ms: 0,
            rollback_enabled: true,
            alloc_batch_size: DEFAULT_ALLOC_BATCH_SIZE,
            has_server: false,
        }
    }
}

impl GridConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: GridConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `GRID_*` variables, keeping the default for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_value("MAX_ITEM_SIZE") {
            config.max_item_size = v.parse()?;
        }
        if let Some(v) = env_value("MAX_SHARED_LINES") {
            config.max_shared_lines = v.parse()?;
        }
        if let Some(v) = env_value("BACKUP_INTERVAL_MS") {
            config.backup_interval_ms = v.parse()?;
        }
        if let Some(v) = env_value("SLAVE_ACK_WARN_MS") {
            config.slave_ack_warn_ms = v.parse()?;
        }
        if let Some(v) = env_value("REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = v.parse()?;
        }
        if let Some(v) = env_value("MAX_STALE_READ_MS") {
            config.max_stale_read_ms = v.parse()?;
        }
        if let Some(v) = env_value("ROLLBACK_ENABLED") {
            config.rollback_enabled = v.parse()?;
        }
        if let Some(v) = env_value("ALLOC_BATCH_SIZE") {
            config.alloc_batch_size = v.parse()?;
        }
        if let Some(v) = env_value("HAS_SERVER") {
            config.has_server = v.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_item_size > MAX_BUFFER_LEN {
            anyhow::bail!(
                "max_item_size {} exceeds the wire limit of {} bytes",
                self.max_item_size,
                MAX_BUFFER_LEN
            );
        }
        if self.max_shared_lines == 0 {
            anyhow::bail!("max_shared_lines must be positive");
        }
        if self.alloc_batch_size == 0 {
            anyhow::bail!("alloc_batch_size must be positive");
        }
        Ok(())
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.backup_interval_ms)
    }

    pub fn slave_ack_warn(&self) -> Duration {
        Duration::from_millis(self.slave_ack_warn_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn max_stale_read(&self) -> Option<Duration> {
        (self.max_stale_read_ms > 0).then(|| Duration::from_millis(self.max_stale_read_ms))
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}
