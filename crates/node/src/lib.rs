//! The session engine: everything that happens between "channel opened"
//! and "both indexes converged".
//!
//! One [`Engine`] owns the process-wide stores and runs one session per
//! connected peer. A session greets, diffs Merkle roots, exchanges index
//! entries, schedules chunk transfers, applies the results at
//! finalization, and publishes a relay delta for whoever was not there
//! to hear it.

pub mod engine;
pub mod folder;
pub mod history;
pub mod locks;
pub mod pairs;
pub mod status;

mod io;
mod session;
mod transfer;

use core::time::Duration;

pub use crate::engine::{ConflictResolution, Engine, SessionReport};
pub use crate::folder::{FolderSink, InMemoryFolder};
pub use crate::history::SyncRecord;
pub use crate::status::{EngineStatus, Phase, TransferProgress};

/// Session-level tuning, mirrored from the config file's `[sync]` table.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub chunk_timeout: Duration,
    pub ping_interval: Duration,
    pub max_concurrent_transfers: usize,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        butterfly_config::SyncConfig::default().into()
    }
}

impl From<butterfly_config::SyncConfig> for SessionConfig {
    fn from(config: butterfly_config::SyncConfig) -> Self {
        Self {
            chunk_timeout: config.chunk_timeout,
            ping_interval: config.ping_interval,
            max_concurrent_transfers: config.max_concurrent_transfers,
            max_retries: config.max_retries,
            base_delay: config.base_delay,
        }
    }
}
