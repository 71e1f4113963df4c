//! Storage layer.
//!
//! [`Storage`] ties the disk worker, the page cache and the write-ahead log
//! together and runs a background maintenance task that rotates and flushes
//! the WAL and evicts cold pages:
//!
//! - **Disk**: page files, one per candle set, served by a background worker
//! - **Memory**: cache of pages with copy-on-write writers
//! - **WAL**: durable log replayed into the page files
//! - **Accessor**: per-transaction view tying the three together

pub mod accessor;
pub mod disk;
pub mod error;
pub mod memory;
pub mod page;
pub mod wal;

pub use accessor::{AccessorState, StorageAccessor};
pub use disk::{Disk, DiskWorker};
pub use error::{StorageError, StorageResult};
pub use memory::{EvictionResult, Memory, MemoryReader, MemoryWriter};
pub use page::{Page, PageHeader};
pub use wal::{FlushResult, WriteAheadLog};

use crate::candle::CandleSet;
use crate::config::Config;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Why an eviction pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    User,
    Periodical,
    AfterWalFlush,
    /// A page load pushed the cache over its limit.
    CacheFull,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvictionReason::User => "user",
            EvictionReason::Periodical => "periodical",
            EvictionReason::AfterWalFlush => "after WAL flush",
            EvictionReason::CacheFull => "cache full",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum MaintenanceJob {
    /// Rotate if the threshold was reached, then flush closed files.
    Flush,
    Evict(EvictionReason),
}

#[derive(Default)]
struct Signals {
    rotate: Arc<Notify>,
    flush: Notify,
    evict: Notify,
    shutdown: Notify,
}

pub struct Storage {
    config: Config,
    disk: Arc<DiskWorker>,
    memory: Memory,
    wal: WriteAheadLog,
    signals: Arc<Signals>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Storage {
    /// Opens storage under `config.directory`, replays leftover WAL files
    /// and starts the maintenance task on `handle`.
    pub fn open(config: Config, handle: &Handle) -> StorageResult<Arc<Self>> {
        std::fs::create_dir_all(&config.directory)?;
        let disk = Arc::new(DiskWorker::spawn(
            Arc::new(Disk::new(&config.directory)),
            handle,
            config.disk_queue_depth,
        ));
        let signals = Arc::new(Signals::default());
        let (wal, recovered) = WriteAheadLog::open(
            config.wal_directory(),
            config.wal_rotate_threshold,
            Arc::clone(&disk),
            Arc::clone(&signals.rotate),
        )?;
        if let Some(recovered) = recovered {
            info!("Recovered from WAL: {}", recovered);
        }

        let storage = Arc::new(Self {
            memory: Memory::new(Arc::clone(&disk)),
            disk,
            wal,
            signals: Arc::clone(&signals),
            maintenance: Mutex::new(None),
            config,
        });

        let task = handle.spawn(run_maintenance(
            Arc::downgrade(&storage),
            signals,
            storage.config.eviction_interval,
            storage.config.flush_interval,
        ));
        *storage.maintenance.lock() = Some(task);
        Ok(storage)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// A fresh, unstarted accessor.
    pub fn accessor(self: &Arc<Self>) -> StorageAccessor {
        StorageAccessor::new(Arc::clone(self))
    }

    pub(crate) fn read_page(&self, set: &CandleSet) -> StorageResult<MemoryReader> {
        let reader = self.memory.read(set)?;
        self.check_cache_size();
        Ok(reader)
    }

    pub(crate) fn write_page(&self, set: &CandleSet) -> StorageResult<MemoryWriter> {
        let writer = self.memory.write(set)?;
        self.check_cache_size();
        Ok(writer)
    }

    fn check_cache_size(&self) {
        if self.memory.len() > self.config.max_memory_pages {
            self.signals.evict.notify_one();
        }
    }

    /// Closes the current WAL file if it holds committed work and replays
    /// every closed file into the page files, then evicts. Returns `None`
    /// when a flush is already running.
    ///
    /// Blocks on disk I/O; call from a plain thread, not from async code.
    pub fn flush_wal(&self) -> StorageResult<Option<FlushResult>> {
        self.wal.seal()?;
        self.flush_closed_files()
    }

    fn flush_closed_files(&self) -> StorageResult<Option<FlushResult>> {
        let result = self.wal.flush()?;
        if result.is_some() {
            self.evict(EvictionReason::AfterWalFlush)?;
        }
        Ok(result)
    }

    /// Runs an eviction pass down to `max_memory_pages`. Returns `None` when
    /// a pass is already running.
    pub fn evict(&self, reason: EvictionReason) -> StorageResult<Option<EvictionResult>> {
        let result = self.memory.evict(self.config.max_memory_pages)?;
        match &result {
            Some(result) => info!("Eviction ({}): {}", reason, result),
            None => debug!("Eviction ({}) skipped: already running", reason),
        }
        Ok(result)
    }

    /// Asks the maintenance task to flush the WAL.
    pub fn request_flush(&self) {
        self.signals.flush.notify_one();
    }

    /// Asks the maintenance task to run an eviction pass.
    pub fn request_eviction(&self) {
        self.signals.evict.notify_one();
    }

    fn run_job(&self, job: MaintenanceJob) -> StorageResult<()> {
        match job {
            MaintenanceJob::Flush => {
                self.wal.rotate()?;
                self.flush_closed_files()?;
            }
            MaintenanceJob::Evict(reason) => {
                self.evict(reason)?;
            }
        }
        Ok(())
    }

    /// Stops the maintenance task, flushes WAL files that are already closed
    /// and stops the disk worker. The current WAL file is left for recovery
    /// on the next open.
    pub fn shutdown(&self) {
        self.signals.shutdown.notify_one();
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
        if let Err(e) = self.wal.flush() {
            warn!("WAL flush during shutdown failed: {}", e);
        }
        self.disk.shutdown();
    }
}

async fn run_maintenance(
    storage: Weak<Storage>,
    signals: Arc<Signals>,
    eviction_interval: Duration,
    flush_interval: Duration,
) {
    let mut eviction_tick = interval_at(Instant::now() + eviction_interval, eviction_interval);
    eviction_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut flush_tick = interval_at(Instant::now() + flush_interval, flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let job = tokio::select! {
            _ = signals.shutdown.notified() => break,
            _ = signals.rotate.notified() => MaintenanceJob::Flush,
            _ = signals.flush.notified() => MaintenanceJob::Flush,
            _ = signals.evict.notified() => MaintenanceJob::Evict(EvictionReason::CacheFull),
            _ = flush_tick.tick() => MaintenanceJob::Flush,
            _ = eviction_tick.tick() => MaintenanceJob::Evict(EvictionReason::Periodical),
        };
        let Some(storage) = storage.upgrade() else {
            break;
        };
        match tokio::task::spawn_blocking(move || storage.run_job(job)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Maintenance job {:?} failed: {}", job, e),
            Err(e) => warn!("Maintenance job {:?} panicked: {}", job, e),
        }
    }
    debug!("Maintenance task stopped");
}
