//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Name of the directory holding WAL files and the transaction counter.
pub const WAL_DIRECTORY: &str = "wal";

/// Configuration for a [`crate::database::Database`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for page files and the WAL.
    pub directory: PathBuf,
    /// Number of cached pages tolerated before eviction kicks in.
    pub max_memory_pages: usize,
    /// Cadence of the periodic eviction pass.
    pub eviction_interval: Duration,
    /// Cadence of the periodic WAL flush.
    pub flush_interval: Duration,
    /// Committed transactions per WAL file before rotating.
    pub wal_rotate_threshold: usize,
    /// Upper bound on lock waits. `None` waits forever.
    pub lock_wait_timeout: Option<Duration>,
    /// Capacity of the disk worker's request queue.
    pub disk_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            directory: PathBuf::from("./candledb_data"),
            max_memory_pages: 64,
            eviction_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(60),
            wal_rotate_threshold: 256,
            lock_wait_timeout: None,
            disk_queue_depth: 64,
        }
    }
}

impl Config {
    /// Config rooted at `directory` with default tuning.
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Config {
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn wal_directory(&self) -> PathBuf {
        self.directory.join(WAL_DIRECTORY)
    }
}
