use crate::candle::{split_by_year, Candle, CandleSet, CandleSetWithoutYear, TimestampCandle};
use crate::command::{CommandContent, InsertCommand};
use crate::concurrency::DatabaseLock;
use crate::config::Config;
use crate::storage::{EvictionReason, EvictionResult, FlushResult, Page, Storage};
use crate::transaction::{TransactionContext, TransactionId};
use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// High-level database interface that owns the background runtime, the
/// storage layer and the lock hierarchy.
pub struct Database {
    runtime: Option<Runtime>,
    storage: Arc<Storage>,
    locks: Arc<DatabaseLock>,
}

impl Database {
    /// Open (or create) the database under `config.directory`, replaying any
    /// WAL files left by a previous run.
    pub fn open(config: Config) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("candledb-worker")
            .build()
            .context("Failed to start background runtime")?;
        let locks = Arc::new(DatabaseLock::with_timeout(config.lock_wait_timeout));
        let directory = config.directory.clone();
        let storage = Storage::open(config, runtime.handle())
            .with_context(|| format!("Failed to open storage at {}", directory.display()))?;
        info!("Opened database at {}", directory.display());

        Ok(Self {
            runtime: Some(runtime),
            storage,
            locks,
        })
    }

    pub fn config(&self) -> &Config {
        self.storage.config()
    }

    pub fn locks(&self) -> &Arc<DatabaseLock> {
        &self.locks
    }

    /// A new, unstarted transaction.
    pub fn access(&self) -> TransactionContext {
        TransactionContext::new(&self.storage, Arc::clone(&self.locks))
    }

    /// Write candles of one market/code/length, split into one insert per
    /// calendar year, as a single transaction.
    pub fn write(&self, set: &CandleSetWithoutYear, candles: &[Candle]) -> Result<TransactionId> {
        let commands: Vec<CommandContent> = split_by_year(candles)?
            .into_iter()
            .map(|(year, candles)| {
                let candles = candles.iter().map(TimestampCandle::from).collect();
                CommandContent::from(InsertCommand::new(set.with_year(year), candles))
            })
            .collect();

        let mut context = self.access();
        for command in &commands {
            context.add_command(command);
        }
        let tx_id = context.start().context("Failed to start write transaction")?;
        for command in &commands {
            context
                .execute(command)
                .with_context(|| format!("Failed to execute {}", command))?;
        }
        context
            .commit()
            .with_context(|| format!("Failed to commit {}", tx_id))?;
        Ok(tx_id)
    }

    /// Snapshot of one page, read under a shared lock in its own
    /// transaction.
    pub fn read_page(&self, set: &CandleSet) -> Result<Page> {
        let mut context = self.access();
        context.add_read(set);
        context.start().context("Failed to start read transaction")?;
        let page = context
            .get(set, false)
            .with_context(|| format!("Failed to read page {}", set))?
            .clone();
        context.commit()?;
        Ok(page)
    }

    /// Replay committed WAL contents into the page files. Returns `None`
    /// when another flush is already running.
    pub fn flush_wal(&self) -> Result<Option<FlushResult>> {
        Ok(self.storage.flush_wal().context("Failed to flush WAL")?)
    }

    /// Run an eviction pass. Returns `None` when another pass is already
    /// running.
    pub fn evict_memory(&self) -> Result<Option<EvictionResult>> {
        Ok(self
            .storage
            .evict(EvictionReason::User)
            .context("Failed to evict pages")?)
    }

    /// Number of pages currently cached.
    pub fn cached_pages(&self) -> usize {
        self.storage.memory().len()
    }

    /// Flush the WAL and stop background work. Every transaction must be
    /// finished before closing.
    pub fn close(mut self) -> Result<()> {
        let flushed = self.storage.flush_wal();
        self.shutdown();
        flushed.context("Failed to flush WAL on close")?;
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        self.storage.shutdown();
        runtime.shutdown_timeout(Duration::from_secs(5));
        info!("Database closed");
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.runtime.is_some() {
            warn!("Database dropped without close; unflushed WAL is replayed on next open");
            self.shutdown();
        }
    }
}
