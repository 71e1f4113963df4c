//! Transactional access to cached pages.
//!
//! A [`StorageAccessor`] goes `Unstarted -> Started -> Finished`. Pages are
//! registered while unstarted, guards are opened on start, commands run while
//! started, and commit or rollback releases everything. Calling an operation
//! in the wrong state is a bug in the caller and panics.

use super::memory::{MemoryReader, MemoryWriter};
use super::wal::PersistRunner;
use super::Storage;
use crate::candle::CandleSet;
use crate::command::{Command, CommandContent, PageAccessor};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::Page;
use crate::transaction::TransactionId;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorState {
    Unstarted,
    Started,
    Finished,
}

pub struct StorageAccessor {
    storage: Arc<Storage>,
    state: AccessorState,
    tx_id: Option<TransactionId>,
    runner: Option<PersistRunner>,
    /// Pages to open on start, by unique key; `true` for exclusive.
    registered: BTreeMap<String, (CandleSet, bool)>,
    readers: HashMap<String, MemoryReader>,
    writers: HashMap<String, MemoryWriter>,
}

impl StorageAccessor {
    pub(crate) fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            state: AccessorState::Unstarted,
            tx_id: None,
            runner: None,
            registered: BTreeMap::new(),
            readers: HashMap::new(),
            writers: HashMap::new(),
        }
    }

    pub fn state(&self) -> AccessorState {
        self.state
    }

    /// Id of the running transaction, once started.
    pub fn tx_id(&self) -> Option<TransactionId> {
        self.tx_id
    }

    fn expect_state(&self, expected: AccessorState, operation: &str) {
        if self.state != expected {
            panic!(
                "storage accessor: {} requires state {:?}, found {:?}",
                operation, expected, self.state
            );
        }
    }

    /// Registers a page to open with a shared guard on start.
    pub fn add_read(&mut self, set: &CandleSet) {
        self.expect_state(AccessorState::Unstarted, "add_read");
        self.registered
            .entry(set.unique_key())
            .or_insert_with(|| (set.clone(), false));
    }

    /// Registers a page to open with an exclusive guard on start.
    pub fn add_write(&mut self, set: &CandleSet) {
        self.expect_state(AccessorState::Unstarted, "add_write");
        self.registered.insert(set.unique_key(), (set.clone(), true));
    }

    /// Begins the WAL transaction and opens the registered pages.
    pub fn start(&mut self) -> StorageResult<TransactionId> {
        self.start_with(|| Ok::<(), StorageError>(()))
    }

    /// Like [`StorageAccessor::start`], running `hook` before the WAL
    /// transaction begins. Callers take their locks in the hook, so the id is
    /// drawn only once nothing can overtake this transaction on its pages.
    /// If the hook fails the accessor finishes without a transaction; if
    /// opening a page fails it is rolled back.
    pub fn start_with<E, F>(&mut self, hook: F) -> Result<TransactionId, E>
    where
        E: From<StorageError>,
        F: FnOnce() -> Result<(), E>,
    {
        self.expect_state(AccessorState::Unstarted, "start");
        if let Err(e) = hook() {
            self.registered.clear();
            self.state = AccessorState::Finished;
            debug!("Start aborted before WAL begin");
            return Err(e);
        }

        let (tx_id, runner) = self.storage.wal().begin()?;
        self.tx_id = Some(tx_id);
        self.runner = Some(runner);
        self.state = AccessorState::Started;
        debug!("{} START", tx_id);

        let registered = std::mem::take(&mut self.registered);
        for (set, exclusive) in registered.values() {
            if let Err(e) = self.open(set, *exclusive) {
                self.rollback();
                return Err(e.into());
            }
        }
        Ok(tx_id)
    }

    fn open(&mut self, set: &CandleSet, exclusive: bool) -> StorageResult<()> {
        let key = set.unique_key();
        if self.writers.contains_key(&key) {
            return Ok(());
        }
        if exclusive {
            // A shared guard would block the exclusive one.
            self.readers.remove(&key);
            let writer = self.storage.write_page(set)?;
            self.writers.insert(key, writer);
        } else if !self.readers.contains_key(&key) {
            let reader = self.storage.read_page(set)?;
            self.readers.insert(key, reader);
        }
        Ok(())
    }

    /// The page for `set` as this transaction sees it, opening it if it was
    /// not registered.
    pub fn get(&mut self, set: &CandleSet, exclusive: bool) -> StorageResult<&Page> {
        self.expect_state(AccessorState::Started, "get");
        self.open(set, exclusive)?;
        let key = set.unique_key();
        if let Some(writer) = self.writers.get(&key) {
            return Ok(writer.content());
        }
        self.readers
            .get(&key)
            .map(|reader| reader.get())
            .ok_or_else(|| StorageError::CorruptedPage(format!("page {} is not open", key)))
    }

    /// Logs `content` to the WAL, then applies it to this transaction's
    /// private page copies.
    pub fn execute(&mut self, content: &CommandContent) -> StorageResult<()> {
        self.expect_state(AccessorState::Started, "execute");
        let tx_id = self.started_tx_id();
        let command = Command::new(tx_id, content.clone());
        self.runner().write(&command)?;
        debug!("{} {}", tx_id, content);
        content.persist(self)
    }

    /// Logs the commit record and publishes every written page.
    pub fn commit(&mut self) -> StorageResult<()> {
        self.expect_state(AccessorState::Started, "commit");
        let tx_id = self.started_tx_id();
        if let Err(e) = self.runner().write(&Command::commit(tx_id)) {
            self.rollback();
            return Err(e);
        }

        self.readers.clear();
        for (_, writer) in self.writers.drain() {
            writer.commit(tx_id);
        }
        self.close_runner();
        self.state = AccessorState::Finished;
        debug!("{} COMMIT", tx_id);
        Ok(())
    }

    /// Discards every private page copy.
    pub fn rollback(&mut self) {
        self.expect_state(AccessorState::Started, "rollback");
        self.readers.clear();
        for (_, writer) in self.writers.drain() {
            writer.rollback();
        }
        self.close_runner();
        self.state = AccessorState::Finished;
        debug!("{} ROLLBACK", self.started_tx_id());
    }

    pub fn rollback_if_active(&mut self) {
        if self.state == AccessorState::Started {
            self.rollback();
        }
    }

    fn started_tx_id(&self) -> TransactionId {
        match self.tx_id {
            Some(tx_id) => tx_id,
            None => panic!("storage accessor started without a transaction id"),
        }
    }

    fn runner(&self) -> &PersistRunner {
        match &self.runner {
            Some(runner) => runner,
            None => panic!("storage accessor started without a WAL runner"),
        }
    }

    fn close_runner(&mut self) {
        if let Some(mut runner) = self.runner.take() {
            runner.close();
        }
    }
}

impl PageAccessor for StorageAccessor {
    /// The private copy of `set`'s page. Fails if a newer transaction has
    /// already committed to the page; writing behind it would leave the
    /// page stamped with an id that hides this change from WAL replay.
    fn page_mut(&mut self, set: &CandleSet) -> StorageResult<&mut Page> {
        self.expect_state(AccessorState::Started, "page_mut");
        let tx_id = self.started_tx_id();
        self.open(set, true)?;
        let key = set.unique_key();
        let writer = self.writers.get_mut(&key).ok_or_else(|| {
            StorageError::CorruptedPage(format!("page {} is not open for write", key))
        })?;
        let page_tx_id = writer.content().last_tx_id();
        if page_tx_id > tx_id.value() {
            return Err(StorageError::StaleTransaction {
                page: key,
                tx_id: tx_id.value(),
                page_tx_id,
            });
        }
        Ok(writer.content_mut())
    }
}

impl Drop for StorageAccessor {
    fn drop(&mut self) {
        self.rollback_if_active();
    }
}
