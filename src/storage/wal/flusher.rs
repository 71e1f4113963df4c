//! Replays log files into the page files.

use super::record::WalRecordReader;
use crate::candle::CandleSet;
use crate::command::{Command, PageAccessor};
use crate::storage::disk::DiskWorker;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::Page;
use crate::transaction::TransactionId;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Summary of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub files: usize,
    /// Committed transactions applied to at least one page.
    pub applied: usize,
    /// Committed transactions already reflected on disk.
    pub skipped: usize,
    /// Transactions without a commit record, discarded.
    pub discarded: usize,
    pub pages_written: usize,
}

impl fmt::Display for FlushResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "files={} applied={} skipped={} discarded={} pages_written={}",
            self.files, self.applied, self.skipped, self.discarded, self.pages_written
        )
    }
}

struct FlushPage {
    page: Page,
    /// `last_tx_id` on disk when the page was loaded.
    baseline: u64,
}

/// Pages loaded during one flush, keyed by [`CandleSet::unique_key`].
#[derive(Default)]
struct FlushPages {
    pages: HashMap<String, FlushPage>,
}

impl FlushPages {
    fn load(&mut self, disk: &DiskWorker, set: &CandleSet) -> StorageResult<&mut FlushPage> {
        let key = set.unique_key();
        if !self.pages.contains_key(&key) {
            let page = disk.read(set)?.unwrap_or_else(|| Page::new(set));
            let baseline = page.last_tx_id();
            self.pages.insert(key.clone(), FlushPage { page, baseline });
        }
        self.pages
            .get_mut(&key)
            .ok_or_else(|| StorageError::CorruptedRecord(format!("page {} vanished during flush", key)))
    }
}

impl PageAccessor for FlushPages {
    fn page_mut(&mut self, set: &CandleSet) -> StorageResult<&mut Page> {
        let key = set.unique_key();
        self.pages
            .get_mut(&key)
            .map(|entry| &mut entry.page)
            .ok_or_else(|| StorageError::CorruptedRecord(format!("page {} was not loaded for replay", key)))
    }
}

/// Applies committed transactions from log files to disk.
///
/// A command is skipped when every page it targets already carried a
/// `last_tx_id` at least as large as the transaction's id when it was read
/// from disk, which makes replaying the same log twice a no-op.
pub struct WalFlusher {
    disk: Arc<DiskWorker>,
}

impl WalFlusher {
    pub fn new(disk: Arc<DiskWorker>) -> Self {
        Self { disk }
    }

    /// Replays `files` in order, writes every touched page once and deletes
    /// the files.
    pub fn flush(&self, files: &[PathBuf]) -> StorageResult<FlushResult> {
        let mut result = FlushResult {
            files: files.len(),
            ..FlushResult::default()
        };
        if files.is_empty() {
            return Ok(result);
        }

        let mut pages = FlushPages::default();
        let mut pending: BTreeMap<TransactionId, Vec<Command>> = BTreeMap::new();

        for file in files {
            debug!("Replaying WAL file {}", file.display());
            let mut reader = WalRecordReader::open(file)?;
            while let Some(command) = reader.next_record()? {
                if command.content.is_commit() {
                    let commands = pending.remove(&command.tx_id).unwrap_or_default();
                    if self.apply(&mut pages, command.tx_id, &commands)? {
                        result.applied += 1;
                    } else {
                        result.skipped += 1;
                    }
                } else {
                    pending.entry(command.tx_id).or_default().push(command);
                }
            }
        }

        result.discarded = pending.len();
        for tx_id in pending.keys() {
            debug!("Discarding uncommitted {}", tx_id);
        }

        for (key, entry) in pages.pages {
            if entry.page.last_tx_id() <= entry.baseline {
                continue;
            }
            if self.disk.write_if_newer(entry.page)? {
                result.pages_written += 1;
            } else {
                debug!("Skipped writing {}: disk copy is newer", key);
            }
        }

        for file in files {
            fs::remove_file(file)?;
        }
        info!("Flushed WAL: {}", result);
        Ok(result)
    }

    /// Applies one committed transaction. Returns whether any command ran.
    fn apply(
        &self,
        pages: &mut FlushPages,
        tx_id: TransactionId,
        commands: &[Command],
    ) -> StorageResult<bool> {
        let mut applied = false;
        for command in commands {
            let mut needed = false;
            for set in command.content.target_sets() {
                let entry = pages.load(&self.disk, &set)?;
                if entry.baseline < tx_id.value() {
                    needed = true;
                }
            }
            if !needed {
                continue;
            }

            command.content.persist(pages)?;
            for set in command.content.target_sets() {
                let page = pages.page_mut(&set)?;
                page.header.last_tx_id = page.header.last_tx_id.max(tx_id.value());
            }
            applied = true;
        }
        Ok(applied)
    }
}
