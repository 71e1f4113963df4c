//! Concurrency control module.
//!
//! This module implements hierarchical two-phase locking for candledb:
//! - Resource naming over the `db / market / code / page` hierarchy
//! - Per-resource multi-granularity locks (IS, IX, S, SIX, X)
//! - Intention locking, promotion and escalation across the hierarchy

pub mod hierarchy;
pub mod lock;
pub mod resource;

pub use hierarchy::DatabaseLock;
pub use lock::{LockEntry, LockError, LockManager, LockOwner, LockResult, LockType};
pub use resource::{ResourceName, ResourceNamePart};
