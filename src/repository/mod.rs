//! Repository layer for gitlayer
//!
//! This module wraps git2 for the transaction engine. The layers above
//! (transactions, recovery) use this API and never touch git2 directly.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  RepositoryController                       │
//! │   (async API: branches, clone, commit, merge, push, fetch)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │    refs     │       │   commit    │       │   remote    │
//!  │ (branches)  │       │ (snapshots) │       │(clone/fetch)│
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gitlayer::repository::{RepositoryController, GitSignature, BranchName};
//!
//! let repo = RepositoryController::open_or_init("./data", GitSignature::default()).await?;
//! repo.ensure_clean_main().await?;
//!
//! let branch = BranchName::new("transaction-01h...-20240101-120000")?;
//! repo.create_branch(&branch).await?;
//! ```

pub mod commit;
mod controller;
mod error;
pub mod refs;
pub mod remote;
mod types;

pub use commit::{CommitInfo, MergeOutcome};
pub(crate) use controller::run_blocking;
pub use controller::RepositoryController;
pub use error::{RepositoryError, RepositoryResult};
pub use refs::{RefManager, ROLLBACK_CHECKPOINT_MESSAGE};
pub use types::{
    branch_timestamp, BranchKind, BranchName, BranchNaming, CommitId, GitSignature, InvalidNameError,
    BRANCH_TIMESTAMP_FORMAT,
};
