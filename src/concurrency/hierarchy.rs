//! Hierarchical two-phase locking over `db / market / code / page`.
//!
//! Nodes live in an arena keyed by resource hash. A node knows its parent's
//! hash and, per transaction, which of its children that transaction holds a
//! lock under. [`DatabaseLock`] turns S/X requests on any node into the
//! intention locks the multi-granularity protocol needs on every ancestor.

use super::lock::{LockError, LockManager, LockOwner, LockResult, LockType};
use super::resource::ResourceName;
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use LockType::*;

/// One resource in the lock hierarchy.
struct LockNode {
    name: ResourceName,
    parent: Option<u64>,
    /// Children each transaction currently holds a lock under.
    children: Mutex<HashMap<LockOwner, HashSet<u64>>>,
}

impl LockNode {
    fn new(name: ResourceName, parent: Option<u64>) -> Self {
        Self {
            name,
            parent,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn hash(&self) -> u64 {
        self.name.hash_value()
    }

    fn add_child_ref(&self, owner: LockOwner, child: u64) {
        self.children.lock().entry(owner).or_default().insert(child);
    }

    fn remove_child_ref(&self, owner: LockOwner, child: u64) {
        let mut children = self.children.lock();
        if let Some(held) = children.get_mut(&owner) {
            held.remove(&child);
            if held.is_empty() {
                children.remove(&owner);
            }
        }
    }

    fn clear_child_refs(&self, owner: LockOwner) {
        self.children.lock().remove(&owner);
    }

    fn child_refs(&self, owner: LockOwner) -> Vec<u64> {
        self.children
            .lock()
            .get(&owner)
            .map(|held| held.iter().copied().collect())
            .unwrap_or_default()
    }

    fn child_count(&self, owner: LockOwner) -> usize {
        self.children.lock().get(&owner).map_or(0, HashSet::len)
    }
}

/// Arena of lock nodes indexed by resource hash.
struct LockTree {
    nodes: DashMap<u64, Arc<LockNode>>,
}

impl LockTree {
    fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// Returns the node for `name`, creating it and any missing ancestors.
    ///
    /// # Panics
    /// If `name` hashes to a node registered under a different path.
    fn node(&self, name: &ResourceName) -> Arc<LockNode> {
        let existing = self
            .nodes
            .get(&name.hash_value())
            .map(|node| Arc::clone(node.value()));
        let node = match existing {
            Some(node) => node,
            None => {
                let parent = name.parent().map(|parent| self.node(&parent).hash());
                self.nodes
                    .entry(name.hash_value())
                    .or_insert_with(|| Arc::new(LockNode::new(name.clone(), parent)))
                    .clone()
            }
        };
        if !node.name.same_path(name) {
            panic!(
                "resource hash collision between '{}' and '{}'",
                node.name, name
            );
        }
        node
    }

    fn get(&self, hash: u64) -> Option<Arc<LockNode>> {
        self.nodes.get(&hash).map(|node| Arc::clone(node.value()))
    }

    fn parent_of(&self, node: &LockNode) -> Option<Arc<LockNode>> {
        node.parent.and_then(|hash| self.get(hash))
    }
}

/// Hierarchy-aware lock orchestrator shared by all transactions.
pub struct DatabaseLock {
    manager: LockManager,
    tree: LockTree,
    next_owner: AtomicU64,
}

impl DatabaseLock {
    pub fn new() -> Self {
        Self::with_timeout(None)
    }

    /// Lock waits give up after `wait_timeout`; `None` waits forever.
    pub fn with_timeout(wait_timeout: Option<Duration>) -> Self {
        Self {
            manager: LockManager::with_timeout(wait_timeout),
            tree: LockTree::new(),
            next_owner: AtomicU64::new(1),
        }
    }

    /// A fresh owner no other transaction uses.
    pub fn new_owner(&self) -> LockOwner {
        LockOwner::new(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Makes sure `owner` holds at least `wanted` (S or X) on `resource`,
    /// taking intention locks on ancestors and escalating held locks as
    /// needed.
    pub fn ensure_lock(
        &self,
        owner: LockOwner,
        resource: &ResourceName,
        wanted: LockType,
    ) -> LockResult<()> {
        if wanted == NoLock {
            return Ok(());
        }
        if wanted != Shared && wanted != Exclusive {
            return Err(LockError::UnexpectedLockType(wanted));
        }

        let node = self.tree.node(resource);
        let explicit = self.held(owner, &node);
        let effective = self.effective(owner, &node);
        if effective.can_substitute(&wanted) {
            debug!(
                "{} already covers {} on '{}' with {}",
                owner, wanted, resource, effective
            );
            return Ok(());
        }

        let parent = self.tree.parent_of(&node);
        if explicit == IntentionExclusive && wanted == Shared {
            // IX plus S is SIX; writes below stay covered.
            return self.promote(owner, &node, SharedIntentionExclusive);
        }
        if explicit != NoLock {
            if wanted == Exclusive {
                if let Some(parent) = &parent {
                    self.acquire_x_intent(owner, parent)?;
                }
            }
            self.escalate(owner, &node)?;
            let escalated = self.held(owner, &node);
            if escalated != Shared && escalated != Exclusive {
                panic!("'{}' escalated to {} instead of S/X", resource, escalated);
            }
            if escalated == Shared && wanted == Exclusive {
                self.promote(owner, &node, Exclusive)?;
            }
            return Ok(());
        }

        if wanted == Shared {
            if let Some(parent) = &parent {
                self.acquire_s_intent(owner, parent)?;
            }
            return self.acquire(owner, &node, Shared);
        }
        if let Some(parent) = &parent {
            self.acquire_x_intent(owner, parent)?;
        }
        self.acquire(owner, &node, Exclusive)
    }

    /// Releases one lock. Fails while the transaction still holds locks
    /// below it.
    pub fn release(&self, owner: LockOwner, resource: &ResourceName) -> LockResult<()> {
        let node = self.tree.node(resource);
        self.release_node(owner, &node)
    }

    /// Releases every lock held by `owner`.
    pub fn free(&self, owner: LockOwner) {
        for name in self.manager.release_all(owner) {
            if let Some(node) = self.tree.get(name.hash_value()) {
                node.clear_child_refs(owner);
            }
        }
    }

    /// Lock explicitly held on `resource`.
    pub fn lock_type(&self, owner: LockOwner, resource: &ResourceName) -> LockType {
        self.manager.lock_type(owner, resource)
    }

    /// Lock held on `resource` either explicitly or implied by an S/SIX/X
    /// ancestor.
    pub fn effective_lock_type(&self, owner: LockOwner, resource: &ResourceName) -> LockType {
        let node = self.tree.node(resource);
        self.effective(owner, &node)
    }

    /// Every lock `owner` holds, ordered by resource hash.
    pub fn held_locks(&self, owner: LockOwner) -> Vec<(ResourceName, LockType)> {
        self.manager.held_locks(owner)
    }

    /// Requests queued on `resource`.
    pub fn waiting(&self, resource: &ResourceName) -> usize {
        self.manager.waiting(resource)
    }

    fn held(&self, owner: LockOwner, node: &LockNode) -> LockType {
        self.manager.lock_type(owner, &node.name)
    }

    /// Explicit lock on `node` joined with what every ancestor implies.
    fn effective(&self, owner: LockOwner, node: &LockNode) -> LockType {
        let mut effective = self.held(owner, node);
        let mut current = self.tree.parent_of(node);
        while let Some(ancestor) = current {
            if effective == Exclusive {
                break;
            }
            effective = effective.join(&self.held(owner, &ancestor).implied_below());
            current = self.tree.parent_of(&ancestor);
        }
        effective
    }

    fn check_parent(&self, owner: LockOwner, node: &LockNode, child: LockType) -> LockResult<()> {
        if let Some(parent) = self.tree.parent_of(node) {
            let parent_type = self.held(owner, &parent);
            if !parent_type.can_be_parent_of(&child) {
                return Err(LockError::IncompatibleParent {
                    resource: node.name.to_string(),
                    child,
                    parent: parent_type,
                });
            }
        }
        Ok(())
    }

    fn acquire(&self, owner: LockOwner, node: &LockNode, lock_type: LockType) -> LockResult<()> {
        self.check_parent(owner, node, lock_type)?;
        self.manager.acquire(owner, &node.name, lock_type)?;
        if let Some(parent) = self.tree.parent_of(node) {
            parent.add_child_ref(owner, node.hash());
        }
        Ok(())
    }

    fn release_node(&self, owner: LockOwner, node: &LockNode) -> LockResult<()> {
        let count = node.child_count(owner);
        if count > 0 {
            return Err(LockError::ChildrenStillLocked {
                resource: node.name.to_string(),
                count,
            });
        }
        self.manager.release(owner, &node.name);
        if let Some(parent) = self.tree.parent_of(node) {
            parent.remove_child_ref(owner, node.hash());
        }
        Ok(())
    }

    fn promote(&self, owner: LockOwner, node: &LockNode, lock_type: LockType) -> LockResult<()> {
        self.check_parent(owner, node, lock_type)?;
        let previous = self.manager.promote(owner, &node.name, lock_type)?;

        // SIX already grants shared access to the whole subtree.
        if previous == IntentionExclusive && lock_type == SharedIntentionExclusive {
            for descendant in self.held_descendants(owner, node) {
                if matches!(self.held(owner, &descendant), Shared | IntentionShared) {
                    self.release_node(owner, &descendant)?;
                }
            }
        }
        Ok(())
    }

    /// Replaces an intention lock on `node` with a direct S (from IS) or X
    /// (from IX/SIX) and drops every lock the transaction holds below it.
    fn escalate(&self, owner: LockOwner, node: &LockNode) -> LockResult<()> {
        let previous = self.held(owner, node);
        let target = match previous {
            Shared | Exclusive => return Ok(()),
            NoLock => panic!("{} escalates '{}' without holding it", owner, node.name),
            IntentionShared => Shared,
            IntentionExclusive | SharedIntentionExclusive => Exclusive,
        };
        debug!("{} escalate '{}' {} -> {}", owner, node.name, previous, target);

        let descendants = self.held_descendants(owner, node);
        self.check_parent(owner, node, target)?;
        self.manager.promote(owner, &node.name, target)?;
        for descendant in &descendants {
            self.manager.release(owner, &descendant.name);
            descendant.clear_child_refs(owner);
        }
        node.clear_child_refs(owner);
        Ok(())
    }

    /// Locked descendants of `node` for `owner`, children before parents.
    fn held_descendants(&self, owner: LockOwner, node: &LockNode) -> Vec<Arc<LockNode>> {
        let mut descendants = Vec::new();
        for hash in node.child_refs(owner) {
            if let Some(child) = self.tree.get(hash) {
                descendants.extend(self.held_descendants(owner, &child));
                if self.held(owner, &child) != NoLock {
                    descendants.push(child);
                }
            }
        }
        descendants
    }

    fn acquire_s_intent(&self, owner: LockOwner, node: &LockNode) -> LockResult<()> {
        match self.held(owner, node) {
            NoLock => {}
            IntentionShared | IntentionExclusive => return Ok(()),
            held => panic!(
                "unexpected ancestor lock {} on '{}' while acquiring IS",
                held, node.name
            ),
        }
        if let Some(parent) = self.tree.parent_of(node) {
            self.acquire_s_intent(owner, &parent)?;
        }
        self.acquire(owner, node, IntentionShared)
    }

    fn acquire_x_intent(&self, owner: LockOwner, node: &LockNode) -> LockResult<()> {
        let held = self.held(owner, node);
        match held {
            IntentionExclusive | SharedIntentionExclusive => return Ok(()),
            Exclusive => panic!(
                "unexpected ancestor lock X on '{}' while acquiring IX",
                node.name
            ),
            NoLock | IntentionShared | Shared => {}
        }
        if let Some(parent) = self.tree.parent_of(node) {
            self.acquire_x_intent(owner, &parent)?;
        }
        match held {
            IntentionShared => self.promote(owner, node, IntentionExclusive),
            Shared => self.promote(owner, node, SharedIntentionExclusive),
            _ => self.acquire(owner, node, IntentionExclusive),
        }
    }
}

impl Default for DatabaseLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn tx(id: u64) -> LockOwner {
        LockOwner::new(id)
    }

    fn market() -> ResourceName {
        ResourceName::root().child("UPBIT")
    }

    fn code() -> ResourceName {
        market().child("BTC")
    }

    fn page(year: u16) -> ResourceName {
        code().child(format!("60:{}", year))
    }

    #[test]
    fn test_exclusive_leaf_takes_intention_locks() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &page(2022), Exclusive).unwrap();

        for ancestor in page(2022).ancestry().iter().take(3) {
            let held = lock.lock_type(tx(1), ancestor);
            assert!(
                matches!(held, IntentionExclusive | SharedIntentionExclusive | Exclusive),
                "{} holds {}",
                ancestor,
                held
            );
        }
        assert_eq!(lock.lock_type(tx(1), &page(2022)), Exclusive);
        assert_eq!(lock.held_locks(tx(1)).len(), 4);
    }

    #[test]
    fn test_shared_leaf_takes_intention_shared() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &page(2022), Shared).unwrap();

        assert_eq!(lock.lock_type(tx(1), &ResourceName::root()), IntentionShared);
        assert_eq!(lock.lock_type(tx(1), &market()), IntentionShared);
        assert_eq!(lock.lock_type(tx(1), &code()), IntentionShared);
        assert_eq!(lock.lock_type(tx(1), &page(2022)), Shared);
    }

    #[test]
    fn test_ancestor_shared_covers_leaf() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &code(), Shared).unwrap();
        lock.ensure_lock(tx(1), &page(2022), Shared).unwrap();

        assert_eq!(lock.lock_type(tx(1), &page(2022)), NoLock);
        assert_eq!(lock.effective_lock_type(tx(1), &page(2022)), Shared);
        assert_eq!(lock.held_locks(tx(1)).len(), 3);
    }

    #[test]
    fn test_escalation_to_shared_releases_descendants() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &page(2021), Shared).unwrap();
        lock.ensure_lock(tx(1), &page(2022), Shared).unwrap();
        assert_eq!(lock.lock_type(tx(1), &code()), IntentionShared);

        lock.ensure_lock(tx(1), &code(), Shared).unwrap();

        assert_eq!(lock.lock_type(tx(1), &code()), Shared);
        assert_eq!(lock.lock_type(tx(1), &page(2021)), NoLock);
        assert_eq!(lock.lock_type(tx(1), &page(2022)), NoLock);
        assert_eq!(lock.lock_type(tx(1), &market()), IntentionShared);
        // The escalated node can be released now that nothing is held below.
        lock.release(tx(1), &code()).unwrap();
    }

    #[test]
    fn test_escalation_to_exclusive() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &page(2022), Exclusive).unwrap();
        lock.ensure_lock(tx(1), &code(), Exclusive).unwrap();

        assert_eq!(lock.lock_type(tx(1), &code()), Exclusive);
        assert_eq!(lock.lock_type(tx(1), &page(2022)), NoLock);
        assert_eq!(lock.lock_type(tx(1), &market()), IntentionExclusive);
        assert_eq!(lock.effective_lock_type(tx(1), &page(2023)), Exclusive);
    }

    #[test]
    fn test_shared_then_exclusive_promotes() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &page(2022), Shared).unwrap();
        lock.ensure_lock(tx(1), &page(2022), Exclusive).unwrap();

        assert_eq!(lock.lock_type(tx(1), &page(2022)), Exclusive);
        assert_eq!(lock.lock_type(tx(1), &code()), IntentionExclusive);
        assert_eq!(lock.lock_type(tx(1), &ResourceName::root()), IntentionExclusive);
    }

    #[test]
    fn test_shared_ancestor_becomes_six() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &code(), Shared).unwrap();
        lock.ensure_lock(tx(1), &page(2022), Exclusive).unwrap();

        assert_eq!(lock.lock_type(tx(1), &code()), SharedIntentionExclusive);
        assert_eq!(lock.lock_type(tx(1), &page(2022)), Exclusive);
        assert_eq!(lock.effective_lock_type(tx(1), &page(2021)), Shared);
    }

    #[test]
    fn test_shared_over_intention_exclusive_becomes_six() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &page(2022), Exclusive).unwrap();
        lock.ensure_lock(tx(1), &page(2021), Shared).unwrap();
        assert_eq!(lock.lock_type(tx(1), &code()), IntentionExclusive);

        lock.ensure_lock(tx(1), &code(), Shared).unwrap();

        assert_eq!(lock.lock_type(tx(1), &code()), SharedIntentionExclusive);
        // The shared page lock is redundant under SIX, the write stays.
        assert_eq!(lock.lock_type(tx(1), &page(2021)), NoLock);
        assert_eq!(lock.lock_type(tx(1), &page(2022)), Exclusive);
        assert_eq!(lock.effective_lock_type(tx(1), &page(2021)), Shared);
        assert_eq!(lock.held_locks(tx(1)).len(), 4);

        lock.free(tx(1));
        assert!(lock.held_locks(tx(1)).is_empty());
    }

    #[test]
    fn test_shared_ancestor_above_intention_covers_leaf() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &market(), Shared).unwrap();
        lock.ensure_lock(tx(1), &page(2022), Exclusive).unwrap();
        assert_eq!(lock.lock_type(tx(1), &market()), SharedIntentionExclusive);
        assert_eq!(lock.lock_type(tx(1), &code()), IntentionExclusive);

        // The market's SIX implies S below the code's IX.
        assert_eq!(lock.effective_lock_type(tx(1), &page(2021)), Shared);
        lock.ensure_lock(tx(1), &page(2021), Shared).unwrap();
        assert_eq!(lock.lock_type(tx(1), &page(2021)), NoLock);
        assert_eq!(lock.effective_lock_type(tx(1), &code()), SharedIntentionExclusive);
    }

    #[test]
    fn test_release_with_children_fails() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &page(2022), Shared).unwrap();

        let err = lock.release(tx(1), &code()).unwrap_err();
        assert!(matches!(err, LockError::ChildrenStillLocked { count: 1, .. }));

        lock.release(tx(1), &page(2022)).unwrap();
        lock.release(tx(1), &code()).unwrap();
    }

    #[test]
    fn test_unexpected_lock_type() {
        let lock = DatabaseLock::new();
        let err = lock
            .ensure_lock(tx(1), &page(2022), IntentionShared)
            .unwrap_err();
        assert_eq!(err, LockError::UnexpectedLockType(IntentionShared));
        lock.ensure_lock(tx(1), &page(2022), NoLock).unwrap();
        assert!(lock.held_locks(tx(1)).is_empty());
    }

    #[test]
    fn test_writers_on_different_pages_do_not_conflict() {
        let lock = DatabaseLock::new();
        lock.ensure_lock(tx(1), &page(2021), Exclusive).unwrap();
        lock.ensure_lock(tx(2), &page(2022), Exclusive).unwrap();
        assert_eq!(lock.lock_type(tx(2), &page(2022)), Exclusive);
    }

    #[test]
    fn test_free_unblocks_conflicting_transaction() {
        let lock = Arc::new(DatabaseLock::new());
        lock.ensure_lock(tx(1), &page(2022), Exclusive).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let handle = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                // S on the code conflicts with the writer's IX there.
                lock.ensure_lock(tx(2), &code(), Shared).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));

        lock.free(tx(1));
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(lock.held_locks(tx(1)).is_empty());
        assert_eq!(lock.lock_type(tx(2), &code()), Shared);
    }

    #[test]
    fn test_timeout_surfaces_as_error() {
        let lock = DatabaseLock::with_timeout(Some(Duration::from_millis(50)));
        lock.ensure_lock(tx(1), &page(2022), Exclusive).unwrap();

        let err = lock.ensure_lock(tx(2), &page(2022), Exclusive).unwrap_err();
        assert!(matches!(err, LockError::WaitTimeout { lock_type: Exclusive, .. }));
        lock.free(tx(2));
        assert!(lock.held_locks(tx(2)).is_empty());
    }
}
