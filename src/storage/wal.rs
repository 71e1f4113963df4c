//! Write-ahead log.
//!
//! Every transaction takes a durable id from the [`WalCounter`] and appends
//! its commands, then a commit record, to the current log file before any
//! page changes become visible. The [`WalFlusher`] later replays committed
//! transactions from closed log files into the page files and deletes the
//! logs; the same replay runs at startup for whatever a crash left behind.

pub mod counter;
pub mod flusher;
pub mod persister;
pub mod record;
pub mod resolver;

pub use counter::WalCounter;
pub use flusher::{FlushResult, WalFlusher};
pub use persister::{PersistRunner, WalPersister};
pub use record::{encode_record, WalRecordReader, RECORD_HEADER_SIZE};
pub use resolver::WalFileResolver;

use crate::storage::disk::DiskWorker;
use crate::storage::error::StorageResult;
use crate::transaction::TransactionId;
use log::{debug, info};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

/// Clears the single-flight flag when a flush ends, including on error.
struct FlushGuard<'a>(&'a Mutex<bool>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = false;
    }
}

pub struct WriteAheadLog {
    resolver: Arc<WalFileResolver>,
    counter: Arc<WalCounter>,
    persister: Arc<WalPersister>,
    flusher: WalFlusher,
    begin_lock: Mutex<()>,
    flushing: Mutex<bool>,
}

impl WriteAheadLog {
    /// Opens the log in `directory`, replaying any log files left from a
    /// previous run before the first new file is created.
    pub fn open(
        directory: impl Into<PathBuf>,
        rotate_threshold: usize,
        disk: Arc<DiskWorker>,
        rotate_signal: Arc<Notify>,
    ) -> StorageResult<(Self, Option<FlushResult>)> {
        let resolver = Arc::new(WalFileResolver::new(directory));
        resolver.ensure_directory()?;
        let counter = Arc::new(WalCounter::open(&resolver.counter_path())?);
        let flusher = WalFlusher::new(disk);

        let leftover = resolver.all_files()?;
        let recovered = if leftover.is_empty() {
            None
        } else {
            info!("Recovering {} WAL file(s)", leftover.len());
            Some(flusher.flush(&leftover)?)
        };

        let persister = Arc::new(WalPersister::open(
            Arc::clone(&resolver),
            Arc::clone(&counter),
            rotate_threshold,
            rotate_signal,
        )?);

        let wal = Self {
            resolver,
            counter,
            persister,
            flusher,
            begin_lock: Mutex::new(()),
            flushing: Mutex::new(false),
        };
        Ok((wal, recovered))
    }

    /// Starts a transaction: a fresh durable id and a runner on the current
    /// log file.
    pub fn begin(&self) -> StorageResult<(TransactionId, PersistRunner)> {
        let _guard = self.begin_lock.lock();
        let tx_id = self.counter.next()?;
        let runner = self.persister.runner();
        debug!("WAL begin {}", tx_id);
        Ok((tx_id, runner))
    }

    /// Last transaction id handed out.
    pub fn last_tx_id(&self) -> TransactionId {
        TransactionId::new(self.counter.now())
    }

    /// Rotates the current file if it has reached the threshold.
    pub fn rotate(&self) -> StorageResult<Option<PathBuf>> {
        self.persister.rotate()
    }

    /// Closes the current file if it holds finished transactions.
    pub fn seal(&self) -> StorageResult<Option<PathBuf>> {
        self.persister.seal()
    }

    /// Replays and deletes every log file except the current one. Returns
    /// `None` when a flush is already running.
    pub fn flush(&self) -> StorageResult<Option<FlushResult>> {
        {
            let mut flushing = self.flushing.lock();
            if *flushing {
                debug!("WAL flush already running");
                return Ok(None);
            }
            *flushing = true;
        }
        let _guard = FlushGuard(&self.flushing);

        let targets = self.persister.closed_files()?;
        self.flusher.flush(&targets).map(Some)
    }

    pub fn directory(&self) -> &std::path::Path {
        self.resolver.directory()
    }
}
