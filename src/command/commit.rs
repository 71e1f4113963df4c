//! COMMIT marker. Carries no body; its presence in the WAL makes every
//! earlier command of the same transaction durable.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitCommand;
