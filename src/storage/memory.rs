//! In-memory page cache.
//!
//! Each cached page sits behind its own reader-writer lock. Readers share the
//! live page; a writer holds the exclusive lock and edits a private copy that
//! replaces the live page only on commit. Eviction is two-phase: a stats pass
//! derives a hit-count threshold, then a range pass visits every page once,
//! writing back and dropping pages at or below the threshold.

use crate::candle::CandleSet;
use crate::storage::disk::DiskWorker;
use crate::storage::error::StorageResult;
use crate::storage::page::Page;
use crate::transaction::TransactionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::BinaryHeap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Cache entry for one page.
pub struct MemoryPage {
    page: Arc<RwLock<Page>>,
    dirty: AtomicBool,
    hits: AtomicU64,
    evicted: AtomicBool,
}

impl MemoryPage {
    fn new(page: Page) -> Self {
        Self {
            page: Arc::new(RwLock::new(page)),
            dirty: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Shared access to a cached page.
pub struct MemoryReader {
    guard: ArcRwLockReadGuard<RawRwLock, Page>,
}

impl MemoryReader {
    pub fn get(&self) -> &Page {
        &self.guard
    }
}

impl Deref for MemoryReader {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

/// Exclusive access to a cached page with copy-on-write content.
pub struct MemoryWriter {
    entry: Arc<MemoryPage>,
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
    content: Page,
}

impl MemoryWriter {
    /// The committed page, unaffected by edits through this writer.
    pub fn original(&self) -> &Page {
        &self.guard
    }

    pub fn content(&self) -> &Page {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut Page {
        &mut self.content
    }

    /// Publishes the private copy and marks the page dirty.
    pub fn commit(self, tid: TransactionId) {
        let MemoryWriter {
            entry,
            mut guard,
            mut content,
        } = self;
        content.header.last_tx_id = content.header.last_tx_id.max(tid.value());
        *guard = content;
        entry.dirty.store(true, Ordering::Release);
    }

    /// Discards the private copy.
    pub fn rollback(self) {}
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionResult {
    /// Cached pages when the pass started.
    pub pages_before: usize,
    /// Pages hit at least once since the previous pass.
    pub accessed: usize,
    pub evicted: usize,
    /// Dirty pages written to disk.
    pub written: usize,
}

impl fmt::Display for EvictionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pages, {} accessed, {} evicted, {} written",
            self.pages_before, self.accessed, self.evicted, self.written
        )
    }
}

/// The page cache.
pub struct Memory {
    pages: DashMap<String, Arc<MemoryPage>>,
    disk: Arc<DiskWorker>,
    evicting: Mutex<bool>,
    /// Bumped after an evicted page is on disk and before it leaves `pages`.
    removals: AtomicU64,
}

impl Memory {
    pub fn new(disk: Arc<DiskWorker>) -> Self {
        Self {
            pages: DashMap::new(),
            disk,
            evicting: Mutex::new(false),
            removals: AtomicU64::new(0),
        }
    }

    pub fn has_page(&self, set: &CandleSet) -> bool {
        self.pages.contains_key(&set.unique_key())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn is_dirty(&self, set: &CandleSet) -> bool {
        self.pages
            .get(&set.unique_key())
            .is_some_and(|entry| entry.is_dirty())
    }

    /// Returns the cache entry for `set`, loading it from disk (or creating
    /// an empty page) on a miss.
    ///
    /// The disk read runs without holding the map shard. A load that raced
    /// with an eviction pass may have read an older file, so it is retried.
    fn load(&self, set: &CandleSet) -> StorageResult<Arc<MemoryPage>> {
        let key = set.unique_key();
        loop {
            if let Some(entry) = self.pages.get(&key).map(|entry| Arc::clone(entry.value())) {
                return Ok(entry);
            }
            let removals = self.removals.load(Ordering::SeqCst);
            let page = match self.disk.read(set)? {
                Some(page) => page,
                None => Page::new(set),
            };
            let blocks = page.body.len();
            match self.pages.entry(key.clone()) {
                Entry::Occupied(entry) => return Ok(Arc::clone(entry.get())),
                Entry::Vacant(slot) => {
                    if self.removals.load(Ordering::SeqCst) != removals {
                        continue;
                    }
                    let entry = Arc::new(MemoryPage::new(page));
                    slot.insert(Arc::clone(&entry));
                    debug!("loaded {} ({} blocks)", set, blocks);
                    return Ok(entry);
                }
            }
        }
    }

    /// Shared guard over the page for `set`.
    pub fn read(&self, set: &CandleSet) -> StorageResult<MemoryReader> {
        loop {
            let entry = self.load(set)?;
            let guard = entry.page.read_arc();
            if entry.evicted.load(Ordering::Acquire) {
                continue;
            }
            entry.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(MemoryReader { guard });
        }
    }

    /// Exclusive guard over the page for `set` with a private copy to edit.
    pub fn write(&self, set: &CandleSet) -> StorageResult<MemoryWriter> {
        loop {
            let entry = self.load(set)?;
            let guard = entry.page.write_arc();
            if entry.evicted.load(Ordering::Acquire) {
                continue;
            }
            entry.hits.fetch_add(1, Ordering::Relaxed);
            let content = guard.clone();
            return Ok(MemoryWriter {
                entry,
                guard,
                content,
            });
        }
    }

    /// Runs one eviction pass bringing the cache down to `max_pages`.
    /// Returns `None` when another pass is already running.
    pub fn evict(&self, max_pages: usize) -> StorageResult<Option<EvictionResult>> {
        {
            let mut running = self.evicting.lock();
            if *running {
                return Ok(None);
            }
            *running = true;
        }
        let (entries, threshold) = self.stats_for_eviction(max_pages);
        let result = self.range_for_eviction(entries, threshold, max_pages);
        *self.evicting.lock() = false;
        result.map(Some)
    }

    /// Snapshot of the cache plus the hit-count threshold: the
    /// `(max_pages + 1)`-th largest hit count, or `None` if nothing needs
    /// evicting.
    fn stats_for_eviction(&self, max_pages: usize) -> (Vec<(String, Arc<MemoryPage>)>, Option<u64>) {
        let entries: Vec<_> = self
            .pages
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        if entries.len() <= max_pages {
            return (entries, None);
        }
        let mut heap: BinaryHeap<u64> = entries.iter().map(|(_, entry)| entry.hits()).collect();
        for _ in 0..max_pages {
            heap.pop();
        }
        let threshold = heap.peek().copied();
        (entries, threshold)
    }

    fn range_for_eviction(
        &self,
        entries: Vec<(String, Arc<MemoryPage>)>,
        threshold: Option<u64>,
        max_pages: usize,
    ) -> StorageResult<EvictionResult> {
        let mut result = EvictionResult {
            pages_before: entries.len(),
            ..Default::default()
        };
        let mut remaining = entries.len();
        for (key, entry) in entries {
            let hits = entry.hits.swap(0, Ordering::Relaxed);
            if hits > 0 {
                result.accessed += 1;
            }
            let Some(threshold) = threshold else {
                continue;
            };
            if remaining <= max_pages || hits > threshold {
                continue;
            }

            let page = entry.page.write();
            if entry.is_dirty() && self.disk.write_if_newer(page.clone())? {
                result.written += 1;
            }
            entry.evicted.store(true, Ordering::Release);
            self.removals.fetch_add(1, Ordering::SeqCst);
            self.pages
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &entry));
            drop(page);

            debug!("evicted {}", key);
            remaining -= 1;
            result.evicted += 1;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::{start_of_year, TimestampCandle};
    use crate::storage::disk::Disk;
    use anyhow::Result;
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::runtime::Runtime;

    fn setup() -> Result<(TempDir, Runtime, Arc<Disk>, Memory)> {
        let dir = tempdir()?;
        let runtime = Runtime::new()?;
        let disk = Arc::new(Disk::new(dir.path()));
        let worker = Arc::new(DiskWorker::spawn(Arc::clone(&disk), runtime.handle(), 8));
        Ok((dir, runtime, disk, Memory::new(worker)))
    }

    fn set(year: u16) -> CandleSet {
        CandleSet::new("UPBIT", "BTC", 60, year)
    }

    fn candle(year: u16, offset: i64) -> TimestampCandle {
        TimestampCandle {
            timestamp: start_of_year(i32::from(year)) + offset,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            bit_fields: 0,
        }
    }

    #[test]
    fn test_miss_creates_empty_page() -> Result<()> {
        let (_dir, _runtime, _disk, memory) = setup()?;
        assert!(!memory.has_page(&set(2022)));
        let reader = memory.read(&set(2022))?;
        assert!(reader.is_empty());
        assert_eq!(reader.candle_set(), set(2022));
        assert!(memory.has_page(&set(2022)));
        Ok(())
    }

    #[test]
    fn test_writer_is_copy_on_write() -> Result<()> {
        let (_dir, _runtime, _disk, memory) = setup()?;
        let mut writer = memory.write(&set(2022))?;
        writer.content_mut().add(&[candle(2022, 60)])?;
        assert!(writer.original().is_empty());
        writer.commit(TransactionId::new(9));

        let reader = memory.read(&set(2022))?;
        assert_eq!(reader.header.count, 1);
        assert_eq!(reader.last_tx_id(), 9);
        assert!(memory.is_dirty(&set(2022)));
        Ok(())
    }

    #[test]
    fn test_rollback_discards_changes() -> Result<()> {
        let (_dir, _runtime, _disk, memory) = setup()?;
        let mut writer = memory.write(&set(2022))?;
        writer.content_mut().add(&[candle(2022, 60)])?;
        writer.rollback();

        assert!(memory.read(&set(2022))?.is_empty());
        assert!(!memory.is_dirty(&set(2022)));
        Ok(())
    }

    #[test]
    fn test_commit_keeps_highest_tx_id() -> Result<()> {
        let (_dir, _runtime, _disk, memory) = setup()?;
        memory.write(&set(2022))?.commit(TransactionId::new(5));
        memory.write(&set(2022))?.commit(TransactionId::new(3));
        assert_eq!(memory.read(&set(2022))?.last_tx_id(), 5);
        Ok(())
    }

    #[test]
    fn test_writer_blocks_readers() -> Result<()> {
        let (_dir, _runtime, _disk, memory) = setup()?;
        let memory = Arc::new(memory);
        let writer = memory.write(&set(2022))?;

        let handle = {
            let memory = Arc::clone(&memory);
            thread::spawn(move || memory.read(&set(2022)).map(|reader| reader.header.last_tx_id))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        writer.commit(TransactionId::new(4));
        assert_eq!(handle.join().unwrap()?, 4);
        Ok(())
    }

    #[test]
    fn test_evicts_least_hit_page_and_writes_back() -> Result<()> {
        let (_dir, _runtime, disk, memory) = setup()?;

        for _ in 0..3 {
            memory.read(&set(2020))?;
        }
        for _ in 0..2 {
            memory.read(&set(2021))?;
        }
        let mut writer = memory.write(&set(2022))?;
        writer.content_mut().add(&[candle(2022, 0), candle(2022, 60)])?;
        writer.commit(TransactionId::new(11));
        assert_eq!(memory.len(), 3);

        let result = memory.evict(2)?.unwrap();
        assert_eq!(result.pages_before, 3);
        assert_eq!(result.evicted, 1);
        assert_eq!(result.written, 1);
        assert_eq!(result.accessed, 3);
        assert!(!memory.has_page(&set(2022)));
        assert!(memory.has_page(&set(2020)));
        assert!(memory.has_page(&set(2021)));

        let on_disk = disk.read(&set(2022))?.unwrap();
        assert_eq!(on_disk.header.count, 2);
        assert_eq!(on_disk.last_tx_id(), 11);

        // Reloads the written page.
        assert_eq!(memory.read(&set(2022))?.header.count, 2);
        Ok(())
    }

    #[test]
    fn test_eviction_noop_under_capacity() -> Result<()> {
        let (_dir, _runtime, _disk, memory) = setup()?;
        memory.read(&set(2022))?;
        let result = memory.evict(2)?.unwrap();
        assert_eq!(result.evicted, 0);
        assert_eq!(memory.len(), 1);
        Ok(())
    }

    #[test]
    fn test_clean_pages_are_not_written() -> Result<()> {
        let (_dir, _runtime, disk, memory) = setup()?;
        memory.read(&set(2021))?;
        memory.read(&set(2022))?;
        let result = memory.evict(0)?.unwrap();
        assert_eq!(result.evicted, 2);
        assert_eq!(result.written, 0);
        assert!(disk.read(&set(2022))?.is_none());
        Ok(())
    }

    #[test]
    fn test_loads_racing_eviction_keep_every_write() -> Result<()> {
        let (_dir, _runtime, disk, memory) = setup()?;
        let memory = Arc::new(memory);
        let done = Arc::new(AtomicBool::new(false));

        let evictor = {
            let memory = Arc::clone(&memory);
            let done = Arc::clone(&done);
            thread::spawn(move || -> Result<()> {
                while !done.load(Ordering::Acquire) {
                    memory.evict(0)?;
                }
                Ok(())
            })
        };
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let memory = Arc::clone(&memory);
                let done = Arc::clone(&done);
                thread::spawn(move || -> Result<()> {
                    while !done.load(Ordering::Acquire) {
                        memory.read(&set(2022))?;
                    }
                    Ok(())
                })
            })
            .collect();

        for i in 0..100u64 {
            let mut writer = memory.write(&set(2022))?;
            writer.content_mut().add(&[candle(2022, i as i64 * 60)])?;
            writer.commit(TransactionId::new(i + 1));
        }
        done.store(true, Ordering::Release);
        evictor.join().unwrap()?;
        for reader in readers {
            reader.join().unwrap()?;
        }

        while memory.evict(0)?.is_none() {}
        let on_disk = disk.read(&set(2022))?.unwrap();
        assert_eq!(on_disk.header.count, 100);
        assert_eq!(on_disk.last_tx_id(), 100);
        Ok(())
    }
}
