//!  Commit creation, merging and working-tree state
//!
//!  In a transaction:
//! - every reported operation becomes one commit on the transaction branch
//! - COMMIT lands the branch on main as a single merge commit
//! - main's checkout must stay clean between transactions
//!
//! this module holds the git2 plumbing for those steps

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use git2::build::CheckoutBuilder;
use git2::{IndexAddOption, Repository, ResetType, Status, StatusOptions};
use tracing::debug;

use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::refs::RefManager;
use crate::repository::types::{BranchName, CommitId, GitSignature};

/// Contents of the `.gitignore` written by the initial commit.
pub const INITIAL_GITIGNORE: &str = ".DS_Store\n*.swp\n";

/// information about a commit
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: CommitId,
    pub parent_ids: Vec<CommitId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitInfo {
    pub(crate) fn from_git2(commit: &git2::Commit<'_>) -> Self {
        let timestamp = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);

        Self {
            id: CommitId::new(commit.id()),
            parent_ids: commit.parent_ids().map(CommitId::new).collect(),
            message: commit.message().unwrap_or("").to_string(),
            timestamp,
        }
    }

    /// check if this is a merge commit (has multiple parents)
    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }

    /// get a short summary of the commit (first line of message)
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

/// What merging a branch into main did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// main gained a merge commit
    Merged(CommitId),
    /// the branch brought nothing main didn't already have
    UpToDate,
}

impl MergeOutcome {
    pub fn commit(&self) -> Option<CommitId> {
        match self {
            MergeOutcome::Merged(id) => Some(*id),
            MergeOutcome::UpToDate => None,
        }
    }
}

/// get information about a commit
pub fn get_commit(repo: &Repository, id: CommitId) -> RepositoryResult<CommitInfo> {
    let commit = repo.find_commit(id.raw())?;
    Ok(CommitInfo::from_git2(&commit))
}

/// create the initial commit for a new repository, on whatever branch HEAD names
pub fn create_initial_commit(
    repo: &Repository,
    workdir: &Path,
    signature: &GitSignature,
) -> RepositoryResult<CommitId> {
    fs::write(workdir.join(".gitignore"), INITIAL_GITIGNORE)?;

    let mut index = repo.index()?;
    index.add_path(Path::new(".gitignore"))?;
    index.write()?;
    let tree = repo.find_tree(index.write_tree()?)?;

    let sig = signature.to_git2_signature()?;
    let oid = repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])?;
    Ok(CommitId::new(oid))
}

/// Stage every change in the working tree: new, modified, and deleted files.
fn stage_all(repo: &Repository) -> RepositoryResult<git2::Oid> {
    let mut index = repo.index()?;
    index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"], None)?;
    index.write()?;
    Ok(index.write_tree()?)
}

/// Stage everything and commit it on HEAD's branch.
///
/// Returns `None` when the staged tree equals HEAD's tree.
pub fn commit_all(
    repo: &Repository,
    message: &str,
    signature: &GitSignature,
) -> RepositoryResult<Option<CommitId>> {
    let tree_id = stage_all(repo)?;
    let parent = repo.head()?.peel_to_commit()?;
    if parent.tree_id() == tree_id {
        debug!(summary = message, "nothing to commit");
        return Ok(None);
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = signature.to_git2_signature()?;
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
    debug!(commit = %oid, summary = message, "committed working tree");
    Ok(Some(CommitId::new(oid)))
}

/// Add a commit with no changes on top of `branch` without checking it out.
pub fn commit_empty_on_branch(
    repo: &Repository,
    branch: &BranchName,
    message: &str,
    signature: &GitSignature,
) -> RepositoryResult<CommitId> {
    let tip = RefManager::resolve_branch(repo, branch)?;
    let parent = repo.find_commit(tip.raw())?;
    let tree = parent.tree()?;
    let sig = signature.to_git2_signature()?;
    let oid = repo.commit(Some(&branch.as_ref_path()), &sig, &sig, message, &tree, &[&parent])?;
    debug!(branch = %branch, commit = %oid, summary = message, "added empty commit");
    Ok(CommitId::new(oid))
}

/// Merge `branch` into main with a two-parent merge commit and check the
/// result out.
///
/// main's ref is only written once the merged tree is known to be
/// conflict-free, so a failed merge leaves main exactly as it was.
pub fn merge_into_main(
    repo: &Repository,
    branch: &BranchName,
    message: &str,
    signature: &GitSignature,
) -> RepositoryResult<MergeOutcome> {
    let main = BranchName::main();
    let ours_id = RefManager::resolve_branch(repo, &main)?;
    let theirs_id = RefManager::resolve_branch(repo, branch)?;

    if ours_id == theirs_id || repo.graph_descendant_of(ours_id.raw(), theirs_id.raw())? {
        return Ok(MergeOutcome::UpToDate);
    }

    let ours = repo.find_commit(ours_id.raw())?;
    let theirs = repo.find_commit(theirs_id.raw())?;
    let mut index = repo.merge_commits(&ours, &theirs, None)?;

    if index.has_conflicts() {
        let mut conflicting_paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                conflicting_paths.push(PathBuf::from(String::from_utf8_lossy(&entry.path).into_owned()));
            }
        }
        return Err(RepositoryError::MergeConflict {
            branch: branch.to_string(),
            conflicting_paths,
        });
    }

    let tree = repo.find_tree(index.write_tree_to(repo)?)?;
    let sig = signature.to_git2_signature()?;
    let oid = repo.commit(
        Some(&main.as_ref_path()),
        &sig,
        &sig,
        message,
        &tree,
        &[&ours, &theirs],
    )?;

    repo.set_head(&main.as_ref_path())?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    debug!(branch = %branch, merge = %oid, "merged into main");

    Ok(MergeOutcome::Merged(CommitId::new(oid)))
}

/// Paths with uncommitted or untracked changes, ignoring `.gitignore`d files.
pub fn dirty_paths(repo: &Repository) -> RepositoryResult<Vec<PathBuf>> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false)
        .exclude_submodules(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    let mut paths = Vec::new();
    for entry in statuses.iter() {
        let status = entry.status();
        if status.is_empty() || status.is_ignored() {
            continue;
        }
        if let Some(path) = entry.path() {
            paths.push(PathBuf::from(path));
        }
    }
    Ok(paths)
}

/// Hard-reset index and working tree to HEAD and delete untracked files.
///
/// Returns how many paths were discarded.
pub fn discard_changes(repo: &Repository) -> RepositoryResult<usize> {
    let discarded = dirty_paths(repo)?.len();

    let head = repo.head()?.peel_to_commit()?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.reset(head.as_object(), ResetType::Hard, Some(&mut checkout))?;

    let workdir = repo
        .workdir()
        .ok_or_else(|| RepositoryError::Internal("bare repositories have no working tree".to_string()))?
        .to_path_buf();

    let mut opts = StatusOptions::new();
    opts.include_untracked(true).include_ignored(false);
    let untracked: Vec<PathBuf> = repo
        .statuses(Some(&mut opts))?
        .iter()
        .filter(|entry| entry.status().contains(Status::WT_NEW))
        .filter_map(|entry| entry.path().map(|p| workdir.join(p)))
        .collect();

    for path in untracked {
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        debug!(path = %path.display(), "removed untracked path");
    }

    Ok(discarded)
}

/// Read a file as committed on a branch.
pub fn read_file_at(repo: &Repository, branch: &BranchName, path: &Path) -> RepositoryResult<Option<Vec<u8>>> {
    let tip = RefManager::resolve_branch(repo, branch)?;
    let tree = repo.find_commit(tip.raw())?.tree()?;
    let entry = match tree.get_path(path) {
        Ok(entry) => entry,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let blob = entry.to_object(repo)?.peel_to_blob()?;
    Ok(Some(blob.content().to_vec()))
}

/// Commits reachable from `from`, newest first.
pub fn history(repo: &Repository, from: CommitId, limit: usize) -> RepositoryResult<Vec<CommitInfo>> {
    let mut walk = repo.revwalk()?;
    walk.push(from.raw())?;
    walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)?;

    let mut commits = Vec::new();
    for oid in walk.take(limit) {
        commits.push(get_commit(repo, CommitId::new(oid?))?);
    }
    Ok(commits)
}
