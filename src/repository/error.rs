//! Repository layer error types
//!
//! Everything the git backend can fail with. None of these are retried by
//! this crate; they carry the underlying diagnostics up to the caller.

use std::path::PathBuf;

use thiserror::Error;

use crate::repository::types::InvalidNameError;

/// the main error type for repository operations
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// lock record serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// invalid branch name
    #[error("invalid branch name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// the path is not a git repository
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    /// the main checkout has uncommitted or untracked changes
    #[error("working tree at {path} has uncommitted changes: {}", paths_display(.changes))]
    DirtyWorkingTree { path: PathBuf, changes: Vec<PathBuf> },

    /// the main checkout is on some other branch
    #[error("repository at {path} is not on main (HEAD: {})", .head.as_deref().unwrap_or("detached"))]
    NotOnMain { path: PathBuf, head: Option<String> },

    /// the main branch does not exist
    #[error("main branch does not exist in {0}")]
    MainMissing(PathBuf),

    /// the specified branch was not found
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// branch already exists
    #[error("branch already exists: {0}")]
    BranchAlreadyExists(String),

    /// merging a branch into main produced conflicts
    #[error("merge of {branch} conflicts on: {}", paths_display(.conflicting_paths))]
    MergeConflict {
        branch: String,
        conflicting_paths: Vec<PathBuf>,
    },

    /// the blocking task running a git call panicked or was cancelled
    #[error("background git task failed during {operation}: {reason}")]
    Background { operation: &'static str, reason: String },

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

fn paths_display(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl RepositoryError {
    /// check if this error is a merge conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::MergeConflict { .. })
    }
}

/// result type alias for repository operations
pub type RepositoryResult<T> = Result<T, RepositoryError>;
