//! Multi-granularity lock types and the per-resource lock manager.
//!
//! [`LockEntry`] implements exclusion for a single resource: a holder table,
//! a FIFO-biased wait queue and a condition variable. [`LockManager`] maps
//! resource hashes to entries and remembers which resources each transaction
//! holds. Hierarchy rules live one level up in [`super::hierarchy`].

use super::resource::ResourceName;
use dashmap::DashMap;
use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Identity locks are held under.
///
/// A transaction gets its owner before it has a WAL id. It takes every lock
/// it registered first and only then draws the id, so two transactions
/// touching the same page always commit in id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockOwner(u64);

impl LockOwner {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner{}", self.0)
    }
}

/// Lock modes for multi-granularity locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockType {
    NoLock = 0,
    IntentionShared = 1,
    IntentionExclusive = 2,
    Shared = 3,
    SharedIntentionExclusive = 4,
    Exclusive = 5,
}

impl LockType {
    pub const ALL: [LockType; 6] = [
        LockType::NoLock,
        LockType::IntentionShared,
        LockType::IntentionExclusive,
        LockType::Shared,
        LockType::SharedIntentionExclusive,
        LockType::Exclusive,
    ];

    /// Whether two transactions may hold `self` and `other` on the same
    /// resource at once.
    pub fn is_compatible_with(&self, other: &LockType) -> bool {
        use LockType::*;
        if *self == NoLock || *other == NoLock {
            return true;
        }
        match self {
            Exclusive => false,
            SharedIntentionExclusive => *other == IntentionShared,
            Shared => matches!(other, Shared | IntentionShared),
            IntentionExclusive => matches!(other, IntentionShared | IntentionExclusive),
            IntentionShared => *other != Exclusive,
            NoLock => true,
        }
    }

    /// Whether a parent held in mode `self` permits a child lock of `child`.
    pub fn can_be_parent_of(&self, child: &LockType) -> bool {
        use LockType::*;
        if *child == NoLock {
            return true;
        }
        match self {
            NoLock => false,
            IntentionShared | Shared => matches!(child, IntentionShared | Shared),
            IntentionExclusive | Exclusive => true,
            SharedIntentionExclusive => matches!(child, IntentionExclusive | Exclusive),
        }
    }

    /// Whether holding `self` grants at least the privileges of `want`.
    pub fn can_substitute(&self, want: &LockType) -> bool {
        use LockType::*;
        match want {
            NoLock => true,
            IntentionShared => *self != NoLock,
            IntentionExclusive => matches!(self, IntentionExclusive | SharedIntentionExclusive | Exclusive),
            Shared => matches!(self, Shared | SharedIntentionExclusive | Exclusive),
            SharedIntentionExclusive => matches!(self, SharedIntentionExclusive | Exclusive),
            Exclusive => *self == Exclusive,
        }
    }

    /// Weakest type that grants everything `self` and `other` grant.
    pub fn join(&self, other: &LockType) -> LockType {
        LockType::ALL
            .into_iter()
            .find(|candidate| candidate.can_substitute(self) && candidate.can_substitute(other))
            .unwrap_or(LockType::Exclusive)
    }

    /// What holding `self` on an ancestor grants on every node below it.
    pub fn implied_below(&self) -> LockType {
        use LockType::*;
        match self {
            Exclusive => Exclusive,
            Shared | SharedIntentionExclusive => Shared,
            NoLock | IntentionShared | IntentionExclusive => NoLock,
        }
    }

    pub fn is_intent(&self) -> bool {
        matches!(
            self,
            LockType::IntentionShared
                | LockType::IntentionExclusive
                | LockType::SharedIntentionExclusive
        )
    }

    /// Intention lock an ancestor needs before `self` can be taken below it.
    pub fn parent_intent(&self) -> LockType {
        use LockType::*;
        match self {
            NoLock => NoLock,
            IntentionShared | Shared => IntentionShared,
            IntentionExclusive | SharedIntentionExclusive | Exclusive => IntentionExclusive,
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockType::NoLock => "NO",
            LockType::IntentionShared => "IS",
            LockType::IntentionExclusive => "IX",
            LockType::Shared => "S",
            LockType::SharedIntentionExclusive => "SIX",
            LockType::Exclusive => "X",
        };
        f.write_str(name)
    }
}

/// Recoverable lock failures. Protocol violations panic instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out waiting for {lock_type} lock on '{resource}'")]
    WaitTimeout { resource: String, lock_type: LockType },

    #[error("Cannot lock '{resource}' with {child} while its parent holds {parent}")]
    IncompatibleParent {
        resource: String,
        child: LockType,
        parent: LockType,
    },

    #[error("Unexpected lock type {0}: only S and X can be requested")]
    UnexpectedLockType(LockType),

    #[error("Cannot release '{resource}' while {count} children are still locked")]
    ChildrenStillLocked { resource: String, count: usize },
}

pub type LockResult<T> = Result<T, LockError>;

/// A queued request. The ticket identifies it until it leaves the queue.
#[derive(Debug)]
struct LockRequest {
    ticket: u64,
    owner: LockOwner,
    lock_type: LockType,
}

#[derive(Debug, Default)]
struct EntryState {
    holders: HashMap<LockOwner, LockType>,
    queue: VecDeque<LockRequest>,
    next_ticket: u64,
}

impl EntryState {
    /// Compatible with every holder other than `owner` itself.
    fn is_compatible(&self, owner: LockOwner, lock_type: LockType) -> bool {
        self.holders
            .iter()
            .all(|(holder, held)| *holder == owner || held.is_compatible_with(&lock_type))
    }

    fn is_queued(&self, ticket: u64) -> bool {
        self.queue.iter().any(|request| request.ticket == ticket)
    }

    fn issue_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// Grants queued requests front-to-back until none is compatible with
    /// the remaining holders.
    fn grant_waiting(&mut self) -> bool {
        let mut granted_any = false;
        loop {
            let position = self
                .queue
                .iter()
                .position(|request| self.is_compatible(request.owner, request.lock_type));
            let Some(request) = position.and_then(|position| self.queue.remove(position)) else {
                break;
            };
            self.holders.insert(request.owner, request.lock_type);
            granted_any = true;
        }
        granted_any
    }
}

/// Grant table and wait queue for one resource.
pub struct LockEntry {
    name: ResourceName,
    state: Mutex<EntryState>,
    granted: Condvar,
}

impl LockEntry {
    pub fn new(name: ResourceName) -> Self {
        Self {
            name,
            state: Mutex::new(EntryState::default()),
            granted: Condvar::new(),
        }
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    /// Acquires `lock_type` for `owner`, blocking while it conflicts with
    /// another holder.
    ///
    /// # Panics
    /// If `owner` already holds a lock on this resource.
    pub fn acquire(
        &self,
        owner: LockOwner,
        lock_type: LockType,
        timeout: Option<Duration>,
    ) -> LockResult<()> {
        let mut state = self.state.lock();
        if let Some(held) = state.holders.get(&owner) {
            panic!(
                "{} already holds {} on '{}'; use promote instead",
                owner, held, self.name
            );
        }
        if state.is_compatible(owner, lock_type) {
            state.holders.insert(owner, lock_type);
            return Ok(());
        }

        let ticket = state.issue_ticket();
        state.queue.push_back(LockRequest {
            ticket,
            owner,
            lock_type,
        });
        self.wait_for_grant(&mut state, ticket, lock_type, timeout)
    }

    /// Upgrades the lock held by `owner` in place and returns the previous
    /// type. A conflicting promotion waits at the front of the queue.
    ///
    /// # Panics
    /// If `owner` holds nothing here, or `lock_type` does not strictly
    /// strengthen the held type.
    pub fn promote(
        &self,
        owner: LockOwner,
        lock_type: LockType,
        timeout: Option<Duration>,
    ) -> LockResult<LockType> {
        let mut state = self.state.lock();
        let Some(previous) = state.holders.get(&owner).copied() else {
            panic!("{} promotes '{}' without holding it", owner, self.name);
        };
        if previous == lock_type || !lock_type.can_substitute(&previous) {
            panic!(
                "{} cannot promote '{}' from {} to {}",
                owner, self.name, previous, lock_type
            );
        }
        if state.is_compatible(owner, lock_type) {
            state.holders.insert(owner, lock_type);
            return Ok(previous);
        }

        let ticket = state.issue_ticket();
        state.queue.push_front(LockRequest {
            ticket,
            owner,
            lock_type,
        });
        self.wait_for_grant(&mut state, ticket, lock_type, timeout)?;
        Ok(previous)
    }

    /// Drops the lock held by `owner` and wakes waiters that became grantable.
    ///
    /// # Panics
    /// If `owner` holds nothing here.
    pub fn release(&self, owner: LockOwner) -> LockType {
        let mut state = self.state.lock();
        let Some(previous) = state.holders.remove(&owner) else {
            panic!("{} releases '{}' without holding it", owner, self.name);
        };
        if state.grant_waiting() {
            self.granted.notify_all();
        }
        previous
    }

    pub fn lock_type(&self, owner: LockOwner) -> LockType {
        self.state
            .lock()
            .holders
            .get(&owner)
            .copied()
            .unwrap_or(LockType::NoLock)
    }

    /// Number of requests currently waiting.
    pub fn waiting(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn wait_for_grant(
        &self,
        state: &mut MutexGuard<'_, EntryState>,
        ticket: u64,
        lock_type: LockType,
        timeout: Option<Duration>,
    ) -> LockResult<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while state.is_queued(ticket) {
            match deadline {
                None => self.granted.wait(state),
                Some(deadline) => {
                    let result = self.granted.wait_until(state, deadline);
                    if result.timed_out() && state.is_queued(ticket) {
                        state.queue.retain(|request| request.ticket != ticket);
                        if state.grant_waiting() {
                            self.granted.notify_all();
                        }
                        return Err(LockError::WaitTimeout {
                            resource: self.name.to_string(),
                            lock_type,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Maps resources to their [`LockEntry`] and tracks what each transaction
/// holds.
pub struct LockManager {
    entries: DashMap<u64, Arc<LockEntry>>,
    owner_locks: DashMap<LockOwner, HashMap<u64, ResourceName>>,
    wait_timeout: Option<Duration>,
}

impl LockManager {
    /// Creates a lock manager whose waits never time out.
    pub fn new() -> Self {
        Self::with_timeout(None)
    }

    pub fn with_timeout(wait_timeout: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            owner_locks: DashMap::new(),
            wait_timeout,
        }
    }

    /// Single get-or-insert entry point for the entry map.
    fn entry(&self, name: &ResourceName) -> Arc<LockEntry> {
        self.entries
            .entry(name.hash_value())
            .or_insert_with(|| Arc::new(LockEntry::new(name.clone())))
            .clone()
    }

    fn held_entry(&self, owner: LockOwner, name: &ResourceName) -> Arc<LockEntry> {
        match self.entries.get(&name.hash_value()) {
            Some(entry) => Arc::clone(entry.value()),
            None => panic!("{} uses '{}' which was never locked", owner, name),
        }
    }

    pub fn acquire(
        &self,
        owner: LockOwner,
        name: &ResourceName,
        lock_type: LockType,
    ) -> LockResult<()> {
        debug!("{} acquire {} on '{}'", owner, lock_type, name);
        let entry = self.entry(name);
        entry.acquire(owner, lock_type, self.wait_timeout)?;
        self.owner_locks
            .entry(owner)
            .or_default()
            .insert(name.hash_value(), name.clone());
        Ok(())
    }

    pub fn promote(
        &self,
        owner: LockOwner,
        name: &ResourceName,
        lock_type: LockType,
    ) -> LockResult<LockType> {
        debug!("{} promote '{}' to {}", owner, name, lock_type);
        self.held_entry(owner, name)
            .promote(owner, lock_type, self.wait_timeout)
    }

    pub fn release(&self, owner: LockOwner, name: &ResourceName) -> LockType {
        debug!("{} release '{}'", owner, name);
        let previous = self.held_entry(owner, name).release(owner);
        let now_empty = match self.owner_locks.get_mut(&owner) {
            Some(mut held) => {
                held.remove(&name.hash_value());
                held.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.owner_locks.remove_if(&owner, |_, held| held.is_empty());
        }
        previous
    }

    /// Releases every lock `owner` holds and returns the released names.
    pub fn release_all(&self, owner: LockOwner) -> Vec<ResourceName> {
        let Some((_, held)) = self.owner_locks.remove(&owner) else {
            return Vec::new();
        };
        debug!("{} release all ({} locks)", owner, held.len());
        let mut released = Vec::with_capacity(held.len());
        for (hash, name) in held {
            let entry = self.entries.get(&hash).map(|entry| Arc::clone(entry.value()));
            if let Some(entry) = entry {
                entry.release(owner);
                released.push(name);
            }
        }
        released
    }

    pub fn lock_type(&self, owner: LockOwner, name: &ResourceName) -> LockType {
        let entry = self
            .entries
            .get(&name.hash_value())
            .map(|entry| Arc::clone(entry.value()));
        entry.map_or(LockType::NoLock, |entry| entry.lock_type(owner))
    }

    /// Every lock `owner` holds, ordered by resource hash.
    pub fn held_locks(&self, owner: LockOwner) -> Vec<(ResourceName, LockType)> {
        let names: Vec<ResourceName> = self
            .owner_locks
            .get(&owner)
            .map(|held| held.values().cloned().collect())
            .unwrap_or_default();
        let mut locks: Vec<_> = names
            .into_iter()
            .map(|name| {
                let lock_type = self.lock_type(owner, &name);
                (name, lock_type)
            })
            .collect();
        locks.sort_by(|a, b| a.0.cmp(&b.0));
        locks
    }

    /// Requests waiting on `name`.
    pub fn waiting(&self, name: &ResourceName) -> usize {
        let entry = self
            .entries
            .get(&name.hash_value())
            .map(|entry| Arc::clone(entry.value()));
        entry.map_or(0, |entry| entry.waiting())
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
