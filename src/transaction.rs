//! Transactions.
//!
//! A [`TransactionContext`] runs commands under strict two-phase locking:
//! every lock it registers up front is taken, in resource hash order, as
//! soon as the WAL hands out the transaction id, and all of them are released
//! together when the transaction commits or rolls back.

pub mod context;
pub mod id;

pub use context::TransactionContext;
pub use id::TransactionId;

use crate::concurrency::LockError;
use crate::storage::error::StorageError;
use thiserror::Error;

/// Errors surfaced by a transaction.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;
