//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid page: magic bytes incorrect")]
    InvalidMagic,

    #[error("Unsupported page version: {0}")]
    UnsupportedVersion(u16),

    #[error("{field} is too long: {actual} bytes (max: {max})")]
    FieldTooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("Candle timestamp {timestamp} is not in range of year {year}")]
    TimestampOutOfRange { year: u16, timestamp: i64 },

    #[error("Corrupted page: {0}")]
    CorruptedPage(String),

    #[error("Unknown command type: {0}")]
    UnknownCommandType(u32),

    #[error("Corrupted WAL record: {0}")]
    CorruptedRecord(String),

    #[error("Page {page} already holds Txn{page_tx_id}, newer than Txn{tx_id}")]
    StaleTransaction {
        page: String,
        tx_id: u64,
        page_tx_id: u64,
    },

    #[error("Disk worker has stopped")]
    WorkerStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
