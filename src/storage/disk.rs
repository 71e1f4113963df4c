//! Page file I/O.
//!
//! Pages live at `<root>/<market>/<candle length>/<code>/<year:05>.ysf`. A
//! missing file means the page does not exist yet. Access to each file is
//! guarded by its own reader-writer lock.

pub mod worker;

pub use worker::DiskWorker;

use crate::candle::CandleSet;
use crate::storage::error::StorageResult;
use crate::storage::page::{Page, PageHeader};
use dashmap::DashMap;
use log::debug;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Page file extension.
pub const PAGE_FILE_EXTENSION: &str = "ysf";

pub struct Disk {
    root: PathBuf,
    file_locks: DashMap<String, Arc<RwLock<()>>>,
}

impl Disk {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the page file for `set`.
    pub fn path_for(&self, set: &CandleSet) -> PathBuf {
        self.root
            .join(&set.market_code)
            .join(set.candle_length.to_string())
            .join(&set.code)
            .join(format!("{:05}.{}", set.year, PAGE_FILE_EXTENSION))
    }

    /// Runs `f` under the file lock for `set`. The lock entry is dropped
    /// again once no other caller holds it.
    fn with_file_lock<T>(&self, set: &CandleSet, f: impl FnOnce(&RwLock<()>) -> T) -> T {
        let key = set.unique_key();
        let lock = self
            .file_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();
        let result = f(&lock);
        drop(lock);
        self.file_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Reads the page for `set`, or `None` if it was never written.
    pub fn read(&self, set: &CandleSet) -> StorageResult<Option<Page>> {
        self.with_file_lock(set, |lock| -> StorageResult<Option<Page>> {
            let _guard = lock.read();
            match open_if_exists(&self.path_for(set))? {
                Some(file) => Ok(Some(Page::read_from(&mut BufReader::new(file))?)),
                None => Ok(None),
            }
        })
    }

    /// Reads only the header of the page for `set`.
    pub fn read_header(&self, set: &CandleSet) -> StorageResult<Option<PageHeader>> {
        self.with_file_lock(set, |lock| {
            let _guard = lock.read();
            self.read_header_unlocked(set)
        })
    }

    fn read_header_unlocked(&self, set: &CandleSet) -> StorageResult<Option<PageHeader>> {
        match open_if_exists(&self.path_for(set))? {
            Some(file) => Ok(Some(PageHeader::read_from(&mut BufReader::new(file))?)),
            None => Ok(None),
        }
    }

    /// Unconditionally writes `page`.
    pub fn write(&self, page: &Page) -> StorageResult<()> {
        let set = page.candle_set();
        self.with_file_lock(&set, |lock| {
            let _guard = lock.write();
            self.write_unlocked(&set, page)
        })
    }

    /// Writes `page` unless the file on disk already carries a `last_tx_id`
    /// greater than or equal to the page's. Returns whether it wrote.
    pub fn write_if_newer(&self, page: &Page) -> StorageResult<bool> {
        let set = page.candle_set();
        self.with_file_lock(&set, |lock| -> StorageResult<bool> {
            let _guard = lock.write();
            if let Some(header) = self.read_header_unlocked(&set)? {
                if header.last_tx_id >= page.last_tx_id() {
                    debug!(
                        "skip writing {}: disk at tx {} >= {}",
                        set,
                        header.last_tx_id,
                        page.last_tx_id()
                    );
                    return Ok(false);
                }
            }
            self.write_unlocked(&set, page)?;
            Ok(true)
        })
    }

    fn write_unlocked(&self, set: &CandleSet, page: &Page) -> StorageResult<()> {
        let path = self.path_for(set);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension(format!("{}.tmp", PAGE_FILE_EXTENSION));
        if let Err(err) = write_synced(&temp_path, page) {
            if let Err(cleanup) = fs::remove_file(&temp_path) {
                debug!("could not remove {:?}: {}", temp_path, cleanup);
            }
            return Err(err);
        }
        fs::rename(&temp_path, &path)?;
        debug!("wrote {} ({} blocks) to {:?}", set, page.body.len(), path);
        Ok(())
    }
}

fn write_synced(path: &Path, page: &Page) -> StorageResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    page.write_to(&mut writer)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_data()?;
    Ok(())
}

fn open_if_exists(path: &Path) -> io::Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
