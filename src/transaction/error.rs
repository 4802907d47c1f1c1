//! Transaction error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::repository::RepositoryError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Two parties tried to write the same repository.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    /// A transaction is already active on this repository in this engine.
    #[error("transaction {active} is already active on {}", .repository.display())]
    NestedTransaction { repository: PathBuf, active: String },

    /// Another transaction holds the write lock.
    #[error("write lock on {} is held by transaction {holder}", .repository.display())]
    WriteLockHeld { repository: PathBuf, holder: String },
}

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Repository layer error.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Merging the transaction branch into main failed; main is unchanged.
    #[error("failed to merge {branch} into main: {source}")]
    MergeFailed {
        branch: String,
        #[source]
        source: RepositoryError,
    },

    /// Operation not valid in the transaction's current state.
    #[error("cannot {operation} transaction {tx_id} in state {state}")]
    InvalidState {
        tx_id: String,
        state: String,
        operation: &'static str,
    },

    /// Internal error.
    #[error("internal transaction error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`TransactionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Repository,
    Concurrency,
    Transaction,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Repository => "repository",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Transaction => "transaction",
        };
        f.write_str(name)
    }
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::Repository(_) => ErrorKind::Repository,
            TransactionError::Concurrency(_) => ErrorKind::Concurrency,
            TransactionError::MergeFailed { .. }
            | TransactionError::InvalidState { .. }
            | TransactionError::Internal(_) => ErrorKind::Transaction,
        }
    }

    /// Check if this error is a merge conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            TransactionError::MergeFailed { source, .. } | TransactionError::Repository(source) => source.is_conflict(),
            _ => false,
        }
    }
}
