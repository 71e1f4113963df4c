//! Transaction context: locking plus storage access for one transaction.

use super::{TransactionId, TransactionResult};
use crate::candle::CandleSet;
use crate::command::{sort_locks, CommandContent, NeededLock};
use crate::concurrency::{DatabaseLock, LockOwner, LockType};
use crate::storage::page::Page;
use crate::storage::{AccessorState, Storage, StorageAccessor};
use std::sync::Arc;

pub struct TransactionContext {
    accessor: StorageAccessor,
    locks: Arc<DatabaseLock>,
    owner: LockOwner,
    registered: Vec<NeededLock>,
    finished: bool,
}

impl TransactionContext {
    pub fn new(storage: &Arc<Storage>, locks: Arc<DatabaseLock>) -> Self {
        Self {
            accessor: storage.accessor(),
            owner: locks.new_owner(),
            locks,
            registered: Vec::new(),
            finished: false,
        }
    }

    /// WAL id, assigned once [`TransactionContext::start`] holds every
    /// registered lock.
    pub fn tx_id(&self) -> Option<TransactionId> {
        self.accessor.tx_id()
    }

    /// Identity this transaction's locks are held under.
    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// Registers a page to read. Only valid before [`TransactionContext::start`].
    pub fn add_read(&mut self, set: &CandleSet) {
        self.accessor.add_read(set);
        self.registered.push(NeededLock::shared(set.resource_name()));
    }

    /// Registers the locks and pages `content` will need. Only valid before
    /// [`TransactionContext::start`].
    pub fn add_command(&mut self, content: &CommandContent) {
        let needed = content.needed_locks();
        for set in content.target_sets() {
            let resource = set.resource_name();
            let exclusive = needed
                .iter()
                .any(|lock| lock.exclusive && lock.resource == resource);
            if exclusive {
                self.accessor.add_write(&set);
            } else {
                self.accessor.add_read(&set);
            }
        }
        self.registered.extend(needed);
    }

    /// Takes every registered lock in resource hash order, then begins the
    /// WAL transaction and opens the registered pages.
    pub fn start(&mut self) -> TransactionResult<TransactionId> {
        let needed = sort_locks(std::mem::take(&mut self.registered));
        let locks = Arc::clone(&self.locks);
        let owner = self.owner;
        let started = self.accessor.start_with(|| -> TransactionResult<()> {
            for lock in &needed {
                locks.ensure_lock(owner, &lock.resource, lock_type(lock.exclusive))?;
            }
            Ok(())
        });
        if started.is_err() {
            self.release_locks();
        }
        started
    }

    /// Runs `content`, taking any lock it needs that is not held yet.
    ///
    /// A write to a page that was not registered is locked after the id was
    /// drawn, so it fails with [`crate::storage::StorageError::StaleTransaction`]
    /// if a newer transaction committed to that page first.
    pub fn execute(&mut self, content: &CommandContent) -> TransactionResult<()> {
        self.expect_started();
        for lock in content.needed_locks() {
            self.locks
                .ensure_lock(self.owner, &lock.resource, lock_type(lock.exclusive))?;
        }
        self.accessor.execute(content)?;
        Ok(())
    }

    /// The page for `set`, locked S (or X when `exclusive`).
    pub fn get(&mut self, set: &CandleSet, exclusive: bool) -> TransactionResult<&Page> {
        self.expect_started();
        self.locks
            .ensure_lock(self.owner, &set.resource_name(), lock_type(exclusive))?;
        Ok(self.accessor.get(set, exclusive)?)
    }

    /// Commits and releases every lock, whether or not the commit succeeded.
    pub fn commit(&mut self) -> TransactionResult<()> {
        let result = self.accessor.commit();
        self.release_locks();
        Ok(result?)
    }

    pub fn rollback(&mut self) {
        self.accessor.rollback();
        self.release_locks();
    }

    pub fn rollback_if_active(&mut self) {
        if self.accessor.state() == AccessorState::Started {
            self.rollback();
        }
    }

    fn expect_started(&self) {
        let state = self.accessor.state();
        if state != AccessorState::Started {
            panic!("transaction context used in state {:?}", state);
        }
    }

    fn release_locks(&mut self) {
        if self.finished {
            return;
        }
        self.locks.free(self.owner);
        self.finished = true;
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        self.rollback_if_active();
    }
}

fn lock_type(exclusive: bool) -> LockType {
    if exclusive {
        LockType::Exclusive
    } else {
        LockType::Shared
    }
}
