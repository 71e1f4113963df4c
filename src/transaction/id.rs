//! Transaction ids.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Id of one write-ahead logged transaction.
///
/// Ids come from the durable WAL counter, start at 1 and are never reused,
/// so they also order page versions: a page stamped with a larger id has
/// seen every change of a smaller one. `0` marks a page no transaction has
/// touched yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const NONE: TransactionId = TransactionId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The id the counter hands out after this one.
    pub fn successor(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txn{}", self.0)
    }
}
