//! Crash recovery.
//!
//! Brings a repository back to a state where a new transaction can begin:
//! no stale git locks, no write lock, main checked out and clean, and no
//! transaction branches older than the retention window. Running it twice
//! is the same as running it once.
//!
//! Only run this when no transaction is live on the repository; it takes
//! the write lock away from whoever holds it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::repository::{run_blocking, BranchName, RepositoryController, RepositoryError, RepositoryResult};
use crate::transaction::{LockRecord, TransactionRegistry, WriteLock};

/// What a recovery run cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Git-internal lock files that were deleted.
    pub git_locks_removed: Vec<PathBuf>,
    /// The write lock that was broken, if one was held.
    pub write_lock_removed: Option<LockRecord>,
    /// Paths discarded from the main checkout.
    pub files_discarded: usize,
    pub branches_pruned: Vec<BranchName>,
    /// Transaction the registry still listed for this repository.
    pub registry_cleared: Option<String>,
}

impl RecoveryReport {
    /// Nothing needed fixing.
    pub fn is_clean(&self) -> bool {
        self.git_locks_removed.is_empty()
            && self.write_lock_removed.is_none()
            && self.files_discarded == 0
            && self.branches_pruned.is_empty()
            && self.registry_cleared.is_none()
    }
}

pub(crate) async fn canonical_repository_path(path: impl Into<PathBuf>) -> RepositoryResult<PathBuf> {
    let path = path.into();
    run_blocking("canonicalize", move || {
        if !path.join(".git").exists() {
            return Err(RepositoryError::NotARepository(path));
        }
        Ok(path.canonicalize()?)
    })
    .await
}

/// Clean up after a crashed or killed transaction.
pub async fn recover(
    repository_path: impl AsRef<Path>,
    config: &EngineConfig,
    registry: &TransactionRegistry,
) -> RepositoryResult<RecoveryReport> {
    let path = canonical_repository_path(repository_path.as_ref()).await?;
    let git_dir = path.join(".git");
    let lock = WriteLock::new(&path, &git_dir, &config.write_lock_filename);
    let mut report = RecoveryReport::default();

    let (git_locks, broken) = run_blocking("clear locks", move || {
        let git_locks = RepositoryController::remove_stale_git_locks(&git_dir)?;
        let holder = lock.holder()?;
        let broken = if lock.release()? { Some(holder) } else { None };
        Ok((git_locks, broken))
    })
    .await?;
    report.git_locks_removed = git_locks;

    if let Some(holder) = broken {
        warn!(
            repository = %path.display(),
            holder = %holder.as_ref().map(|r| r.transaction_id.as_str()).unwrap_or("unknown"),
            "broke stale write lock"
        );
        report.write_lock_removed = holder;
    }

    let repo = RepositoryController::open(&path, config.signature()).await?;
    report.files_discarded = repo.reset_to_main().await?;

    report.registry_cleared = registry.clear(&path).map(|entry| entry.transaction_id);

    match config.retention().and_then(|window| Utc::now().checked_sub_signed(window)) {
        Some(cutoff) => {
            report.branches_pruned = repo
                .prune_transaction_branches(&config.naming(), cutoff, registry.active_ids())
                .await?;
        }
        None => warn!(
            hours = config.cleanup_old_branches_hours,
            "retention window out of range, keeping all transaction branches"
        ),
    }

    info!(
        repository = %path.display(),
        git_locks = report.git_locks_removed.len(),
        write_lock = report.write_lock_removed.is_some(),
        files_discarded = report.files_discarded,
        branches_pruned = report.branches_pruned.len(),
        "recovery finished"
    );
    Ok(report)
}
