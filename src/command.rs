//! Commands: the units of work logged to the WAL and applied to pages.
//!
//! The variant set is closed. Each command knows its binary body, the pages
//! it touches, the locks it needs and how to apply itself to pages obtained
//! through a [`PageAccessor`].

pub mod commit;
pub mod insert;

pub use commit::CommitCommand;
pub use insert::InsertCommand;

use crate::candle::CandleSet;
use crate::concurrency::ResourceName;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::Page;
use crate::transaction::TransactionId;
use bytes::BytesMut;
use std::fmt;

pub const COMMIT_COMMAND_TYPE: u32 = 1;
pub const INSERT_COMMAND_TYPE: u32 = 2;

/// Source of mutable pages for [`CommandContent::persist`].
pub trait PageAccessor {
    /// Exclusive, mutable view of the page for `set`.
    fn page_mut(&mut self, set: &CandleSet) -> StorageResult<&mut Page>;
}

/// A lock a command requires before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeededLock {
    pub resource: ResourceName,
    pub exclusive: bool,
}

impl NeededLock {
    pub fn shared(resource: ResourceName) -> Self {
        Self {
            resource,
            exclusive: false,
        }
    }

    pub fn exclusive(resource: ResourceName) -> Self {
        Self {
            resource,
            exclusive: true,
        }
    }
}

/// Sorts locks by resource hash and merges duplicates, keeping the
/// exclusive request when both kinds are present.
pub fn sort_locks(mut locks: Vec<NeededLock>) -> Vec<NeededLock> {
    locks.sort_by(|a, b| a.resource.cmp(&b.resource).then(b.exclusive.cmp(&a.exclusive)));
    locks.dedup_by(|later, earlier| later.resource == earlier.resource);
    locks
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandContent {
    Insert(InsertCommand),
    Commit(CommitCommand),
}

impl CommandContent {
    pub fn type_id(&self) -> u32 {
        match self {
            CommandContent::Insert(_) => INSERT_COMMAND_TYPE,
            CommandContent::Commit(_) => COMMIT_COMMAND_TYPE,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, CommandContent::Commit(_))
    }

    /// Encoded body length in bytes.
    pub fn body_len(&self) -> usize {
        match self {
            CommandContent::Insert(insert) => insert.body_len(),
            CommandContent::Commit(_) => 0,
        }
    }

    pub fn encode_body(&self, buf: &mut BytesMut) -> StorageResult<()> {
        match self {
            CommandContent::Insert(insert) => insert.encode(buf),
            CommandContent::Commit(_) => Ok(()),
        }
    }

    pub fn decode(type_id: u32, body: &[u8]) -> StorageResult<Self> {
        match type_id {
            INSERT_COMMAND_TYPE => Ok(CommandContent::Insert(InsertCommand::decode(body)?)),
            COMMIT_COMMAND_TYPE => Ok(CommandContent::Commit(CommitCommand)),
            other => Err(StorageError::UnknownCommandType(other)),
        }
    }

    /// Pages this command touches.
    pub fn target_sets(&self) -> Vec<CandleSet> {
        match self {
            CommandContent::Insert(insert) => vec![insert.set.clone()],
            CommandContent::Commit(_) => Vec::new(),
        }
    }

    /// Locks this command needs, sorted by resource hash.
    pub fn needed_locks(&self) -> Vec<NeededLock> {
        let locks = match self {
            CommandContent::Insert(insert) => vec![NeededLock::exclusive(insert.set.resource_name())],
            CommandContent::Commit(_) => Vec::new(),
        };
        sort_locks(locks)
    }

    /// Applies the command to pages from `accessor`.
    pub fn persist(&self, accessor: &mut dyn PageAccessor) -> StorageResult<()> {
        match self {
            CommandContent::Insert(insert) => insert.persist(accessor),
            CommandContent::Commit(_) => Ok(()),
        }
    }
}

impl fmt::Display for CommandContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandContent::Insert(insert) => write!(f, "INSERT({})", insert.set),
            CommandContent::Commit(_) => f.write_str("COMMIT"),
        }
    }
}

impl From<InsertCommand> for CommandContent {
    fn from(insert: InsertCommand) -> Self {
        CommandContent::Insert(insert)
    }
}

/// A command bound to the transaction that issued it.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub tx_id: TransactionId,
    pub content: CommandContent,
}

impl Command {
    pub fn new(tx_id: TransactionId, content: CommandContent) -> Self {
        Self { tx_id, content }
    }

    pub fn commit(tx_id: TransactionId) -> Self {
        Self::new(tx_id, CommandContent::Commit(CommitCommand))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tx_id, self.content)
    }
}
