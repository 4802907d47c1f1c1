//!  Branch and reference management.
//!
//!  Git refs are pointers to commits.  This module handles:
//! - Main branch management and legacy trunk normalisation
//! - Branch lifecycle (create, delete, list, checkout)
//! - Pruning of stale transaction branches
//!
//! Transaction branches are `{prefix}-{id}-{timestamp}` and failure branches
//! `{prefix}-{timestamp}-{id}`; see [`BranchNaming`]. A rolled back
//! transaction keeps its branch name; its tip is a commit with
//! [`ROLLBACK_CHECKPOINT_MESSAGE`].

use chrono::{DateTime, TimeZone, Utc};
use git2::build::CheckoutBuilder;
use git2::{BranchType, ErrorCode, Repository};
use tracing::{debug, info};

use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::types::{BranchKind, BranchName, BranchNaming, CommitId};

/// Message of the commit that marks a transaction branch as rolled back.
pub const ROLLBACK_CHECKPOINT_MESSAGE: &str = "Rollback checkpoint";

/// Manages Git references (branches).
pub struct RefManager;

impl RefManager {
    /// Resolve a branch name to its current commit ID.
    pub fn resolve_branch(repo: &Repository, branch: &BranchName) -> RepositoryResult<CommitId> {
        let reference = repo
            .find_reference(&branch.as_ref_path())
            .map_err(|_| RepositoryError::BranchNotFound(branch.to_string()))?;

        let commit = reference
            .peel_to_commit()
            .map_err(|_| RepositoryError::BranchNotFound(branch.to_string()))?;

        Ok(CommitId::new(commit.id()))
    }

    /// Get the current HEAD commit.
    pub fn head_commit(repo: &Repository) -> RepositoryResult<CommitId> {
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(CommitId::new(commit.id()))
    }

    /// The branch HEAD points at, or `None` when detached.
    pub fn current_branch(repo: &Repository) -> RepositoryResult<Option<String>> {
        match repo.head() {
            Ok(head) if head.is_branch() => Ok(head.shorthand().map(str::to_string)),
            Ok(_) => Ok(None),
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                // HEAD names a branch with no commits yet
                let head = repo.find_reference("HEAD")?;
                Ok(head
                    .symbolic_target()
                    .and_then(|t| t.strip_prefix("refs/heads/"))
                    .map(str::to_string))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a branch exists.
    pub fn branch_exists(repo: &Repository, branch: &BranchName) -> bool {
        repo.find_reference(&branch.as_ref_path()).is_ok()
    }

    /// Create a new branch pointing to the given commit.
    pub fn create_branch(repo: &Repository, branch: &BranchName, target: CommitId) -> RepositoryResult<()> {
        if Self::branch_exists(repo, branch) {
            return Err(RepositoryError::BranchAlreadyExists(branch.to_string()));
        }

        let commit = repo.find_commit(target.raw())?;
        repo.branch(branch.as_str(), &commit, false)?;
        debug!(branch = %branch, target = %target.short(), "created branch");

        Ok(())
    }

    /// Delete a branch, whether or not it is merged.
    pub fn delete_branch(repo: &Repository, branch: &BranchName) -> RepositoryResult<()> {
        let mut git_branch = repo
            .find_branch(branch.as_str(), BranchType::Local)
            .map_err(|_| RepositoryError::BranchNotFound(branch.to_string()))?;

        git_branch.delete()?;
        debug!(branch = %branch, "deleted branch");

        Ok(())
    }

    /// List all branches with an optional prefix filter.
    pub fn list_branches(repo: &Repository, prefix: Option<&str>) -> RepositoryResult<Vec<BranchName>> {
        let branches = repo.branches(Some(BranchType::Local))?;

        let mut result = Vec::new();
        for branch_result in branches {
            let (branch, _) = branch_result?;
            if let Some(name) = branch.name()? {
                let matches = match prefix {
                    Some(p) => name.starts_with(p),
                    None => true,
                };
                if matches {
                    if let Ok(branch_name) = BranchName::new(name) {
                        result.push(branch_name);
                    }
                }
            }
        }

        result.sort();
        Ok(result)
    }

    /// Point HEAD at a branch and update the working tree to match it.
    ///
    /// A forced checkout overwrites local modifications.
    pub fn checkout_branch(repo: &Repository, branch: &BranchName, force: bool) -> RepositoryResult<()> {
        let target = Self::resolve_branch(repo, branch)?;
        let object = repo.find_object(target.raw(), None)?;

        let mut opts = CheckoutBuilder::new();
        if force {
            opts.force();
        } else {
            opts.safe();
        }
        repo.checkout_tree(&object, Some(&mut opts))?;
        repo.set_head(&branch.as_ref_path())?;
        debug!(branch = %branch, force, "checked out branch");

        Ok(())
    }

    /// Rename a legacy `master` trunk to `main`.
    ///
    /// Returns true when a rename happened.
    pub fn normalize_trunk(repo: &Repository) -> RepositoryResult<bool> {
        let main = BranchName::main();
        if Self::branch_exists(repo, &main) {
            return Ok(false);
        }

        let mut legacy = match repo.find_branch(BranchName::LEGACY_MAIN, BranchType::Local) {
            Ok(branch) => branch,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let was_head = legacy.is_head();
        legacy.rename(BranchName::MAIN, false)?;
        if was_head {
            repo.set_head(&main.as_ref_path())?;
        }
        info!(path = ?repo.workdir(), "renamed legacy trunk to main");

        Ok(true)
    }

    /// Commit time of a branch tip.
    pub fn tip_time(repo: &Repository, branch: &BranchName) -> RepositoryResult<DateTime<Utc>> {
        let tip = Self::resolve_branch(repo, branch)?;
        let commit = repo.find_commit(tip.raw())?;
        Utc.timestamp_opt(commit.time().seconds(), 0)
            .single()
            .ok_or_else(|| RepositoryError::Internal(format!("commit {} has an invalid time", tip)))
    }

    /// Whether the branch tip is a rollback checkpoint.
    pub fn is_rollback_branch(repo: &Repository, branch: &BranchName) -> RepositoryResult<bool> {
        let tip = Self::resolve_branch(repo, branch)?;
        let commit = repo.find_commit(tip.raw())?;
        Ok(commit.summary() == Some(ROLLBACK_CHECKPOINT_MESSAGE))
    }

    /// Delete transaction branches with no activity since `cutoff`.
    ///
    /// Activity is the later of the creation time encoded in the name and the
    /// tip commit time. Failure branches, rollback branches and anything in
    /// `keep` are never touched. Returns the deleted branches.
    pub fn prune_transaction_branches(
        repo: &Repository,
        naming: &BranchNaming,
        cutoff: DateTime<Utc>,
        keep: &[String],
    ) -> RepositoryResult<Vec<BranchName>> {
        let current = Self::current_branch(repo)?;
        let mut deleted = Vec::new();

        for branch in Self::list_branches(repo, Some(naming.transaction_prefix()))? {
            if naming.classify(&branch) != BranchKind::Transaction {
                continue;
            }
            if current.as_deref() == Some(branch.as_str()) {
                continue;
            }
            let Some((tx_id, created)) = naming.parse_transaction_branch(&branch) else {
                continue;
            };
            if keep.iter().any(|id| id == tx_id) || Self::is_rollback_branch(repo, &branch)? {
                continue;
            }

            let tip = Self::tip_time(repo, &branch)?;
            let last_activity = created.map_or(tip, |c| c.max(tip));
            if last_activity < cutoff {
                Self::delete_branch(repo, &branch)?;
                info!(branch = %branch, %last_activity, "pruned stale transaction branch");
                deleted.push(branch);
            }
        }

        Ok(deleted)
    }
}
