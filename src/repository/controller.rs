//!   Async controller over one git repository.
//!
//!  `git2` calls block, so every operation here is shipped to tokio's
//!  blocking pool. The repository handle lives behind a mutex that the
//!  blocking closure holds for the whole call, which gives at most one
//!  outstanding backend call per repository.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use git2::{Repository, RepositoryInitOptions};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::repository::commit::{self, CommitInfo, MergeOutcome};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::refs::{RefManager, ROLLBACK_CHECKPOINT_MESSAGE};
use crate::repository::remote;
use crate::repository::types::{BranchName, BranchNaming, CommitId, GitSignature};

/// Lock files git leaves behind when a command is interrupted.
const GIT_INTERNAL_LOCKS: &[&str] = &["index.lock", "HEAD.lock", "refs/heads/main.lock"];

/// Handle on a non-bare git repository.
///
/// Clone this to share - it uses Arc internally.
#[derive(Clone)]
pub struct RepositoryController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    repo: Mutex<Repository>,
    workdir: PathBuf,
    git_dir: PathBuf,
    signature: GitSignature,
}

impl RepositoryController {
    fn from_repository(repo: Repository, signature: GitSignature) -> RepositoryResult<Self> {
        let workdir = repo
            .workdir()
            .ok_or_else(|| RepositoryError::NotARepository(repo.path().to_path_buf()))?
            .to_path_buf();
        let git_dir = repo.path().to_path_buf();

        Ok(Self {
            inner: Arc::new(ControllerInner {
                repo: Mutex::new(repo),
                workdir,
                git_dir,
                signature,
            }),
        })
    }

    /// Open an existing repository, renaming a legacy trunk to `main` and
    /// giving an unborn `main` its initial commit.
    pub fn open_blocking(path: &Path, signature: GitSignature) -> RepositoryResult<Self> {
        if !path.join(".git").exists() {
            return Err(RepositoryError::NotARepository(path.to_path_buf()));
        }
        let repo = Repository::open(path).map_err(|_| RepositoryError::NotARepository(path.to_path_buf()))?;

        RefManager::normalize_trunk(&repo)?;
        if repo.head().is_err() && RefManager::current_branch(&repo)?.as_deref() == Some(BranchName::MAIN) {
            commit::create_initial_commit(&repo, path, &signature)?;
            info!(path = %path.display(), "created initial commit on unborn main");
        }

        Self::from_repository(repo, signature)
    }

    /// Initialize a new repository with `main` as its trunk and an initial commit.
    pub fn init_blocking(path: &Path, signature: GitSignature) -> RepositoryResult<Self> {
        fs::create_dir_all(path)?;
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(BranchName::MAIN);
        let repo = Repository::init_opts(path, &opts)?;

        commit::create_initial_commit(&repo, path, &signature)?;
        info!(path = %path.display(), "initialized repository");

        Self::from_repository(repo, signature)
    }

    /// Open or initialize a repository.
    pub fn open_or_init_blocking(path: &Path, signature: GitSignature) -> RepositoryResult<Self> {
        if path.join(".git").exists() {
            Self::open_blocking(path, signature)
        } else {
            Self::init_blocking(path, signature)
        }
    }

    /// Async [`RepositoryController::open_or_init_blocking`].
    pub async fn open_or_init(path: impl Into<PathBuf>, signature: GitSignature) -> RepositoryResult<Self> {
        let path = path.into();
        run_blocking("open_or_init", move || Self::open_or_init_blocking(&path, signature)).await
    }

    /// Async [`RepositoryController::open_blocking`].
    pub async fn open(path: impl Into<PathBuf>, signature: GitSignature) -> RepositoryResult<Self> {
        let path = path.into();
        run_blocking("open", move || Self::open_blocking(&path, signature)).await
    }

    /// The working tree root.
    pub fn path(&self) -> &Path {
        &self.inner.workdir
    }

    /// The `.git` directory.
    pub fn git_dir(&self) -> &Path {
        &self.inner.git_dir
    }

    pub fn signature(&self) -> &GitSignature {
        &self.inner.signature
    }

    /// Execute a function with the repository on the calling thread.
    pub fn with_repo<F, T>(&self, f: F) -> RepositoryResult<T>
    where
        F: FnOnce(&Repository) -> RepositoryResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    /// Execute a function with the repository on the blocking pool.
    async fn run<F, T>(&self, operation: &'static str, f: F) -> RepositoryResult<T>
    where
        F: FnOnce(&Repository, &ControllerInner) -> RepositoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        run_blocking(operation, move || {
            let repo = inner.repo.lock();
            f(&repo, &inner)
        })
        .await
    }

    // ==================== Inspection ====================

    /// Tip of main.
    pub async fn head(&self) -> RepositoryResult<CommitId> {
        self.run("head", |repo, _| RefManager::resolve_branch(repo, &BranchName::main()))
            .await
    }

    /// The branch HEAD points at.
    pub async fn current_branch(&self) -> RepositoryResult<Option<String>> {
        self.run("current_branch", |repo, _| RefManager::current_branch(repo))
            .await
    }

    /// Paths with uncommitted or untracked changes.
    pub async fn dirty_paths(&self) -> RepositoryResult<Vec<PathBuf>> {
        self.run("dirty_paths", |repo, _| commit::dirty_paths(repo)).await
    }

    pub async fn is_clean(&self) -> RepositoryResult<bool> {
        Ok(self.dirty_paths().await?.is_empty())
    }

    /// Fail unless main is checked out with a clean working tree.
    pub async fn ensure_clean_main(&self) -> RepositoryResult<()> {
        self.run("ensure_clean_main", |repo, inner| {
            let head = RefManager::current_branch(repo)?;
            if head.as_deref() != Some(BranchName::MAIN) {
                return Err(RepositoryError::NotOnMain {
                    path: inner.workdir.clone(),
                    head,
                });
            }
            let changes = commit::dirty_paths(repo)?;
            if !changes.is_empty() {
                return Err(RepositoryError::DirtyWorkingTree {
                    path: inner.workdir.clone(),
                    changes,
                });
            }
            Ok(())
        })
        .await
    }

    pub async fn get_commit(&self, id: CommitId) -> RepositoryResult<CommitInfo> {
        self.run("get_commit", move |repo, _| commit::get_commit(repo, id))
            .await
    }

    /// Commits reachable from a branch, newest first.
    pub async fn history(&self, branch: &BranchName, limit: usize) -> RepositoryResult<Vec<CommitInfo>> {
        let branch = branch.clone();
        self.run("history", move |repo, _| {
            let tip = RefManager::resolve_branch(repo, &branch)?;
            commit::history(repo, tip, limit)
        })
        .await
    }

    /// Read a file as committed on a branch.
    pub async fn read_file(&self, branch: &BranchName, path: impl Into<PathBuf>) -> RepositoryResult<Option<Vec<u8>>> {
        let branch = branch.clone();
        let path = path.into();
        self.run("read_file", move |repo, _| commit::read_file_at(repo, &branch, &path))
            .await
    }

    // ==================== Branch Operations ====================

    /// Create a branch at the current tip of main.
    pub async fn create_branch(&self, branch: &BranchName) -> RepositoryResult<CommitId> {
        let branch = branch.clone();
        self.run("create_branch", move |repo, _| {
            let base = RefManager::resolve_branch(repo, &BranchName::main())?;
            RefManager::create_branch(repo, &branch, base)?;
            Ok(base)
        })
        .await
    }

    pub async fn delete_branch(&self, branch: &BranchName) -> RepositoryResult<()> {
        let branch = branch.clone();
        self.run("delete_branch", move |repo, _| RefManager::delete_branch(repo, &branch))
            .await
    }

    pub async fn branch_exists(&self, branch: &BranchName) -> RepositoryResult<bool> {
        let branch = branch.clone();
        self.run("branch_exists", move |repo, _| Ok(RefManager::branch_exists(repo, &branch)))
            .await
    }

    /// List local branches, optionally only those starting with `prefix`.
    pub async fn list_branches(&self, prefix: Option<&str>) -> RepositoryResult<Vec<BranchName>> {
        let prefix = prefix.map(str::to_string);
        self.run("list_branches", move |repo, _| RefManager::list_branches(repo, prefix.as_deref()))
            .await
    }

    /// Check out a branch without overwriting local changes.
    pub async fn checkout(&self, branch: &BranchName) -> RepositoryResult<()> {
        let branch = branch.clone();
        self.run("checkout", move |repo, _| RefManager::checkout_branch(repo, &branch, false))
            .await
    }

    pub async fn is_rollback_branch(&self, branch: &BranchName) -> RepositoryResult<bool> {
        let branch = branch.clone();
        self.run("is_rollback_branch", move |repo, _| RefManager::is_rollback_branch(repo, &branch))
            .await
    }

    /// Make sure `branch` ends in a rollback checkpoint so pruning leaves it
    /// alone. Returns the marker commit if one had to be added.
    pub async fn seal_rollback_branch(&self, branch: &BranchName) -> RepositoryResult<Option<CommitId>> {
        let branch = branch.clone();
        self.run("seal_rollback_branch", move |repo, inner| {
            if RefManager::is_rollback_branch(repo, &branch)? {
                return Ok(None);
            }
            commit::commit_empty_on_branch(repo, &branch, ROLLBACK_CHECKPOINT_MESSAGE, &inner.signature).map(Some)
        })
        .await
    }

    /// Delete transaction branches with no activity since `cutoff`, sparing
    /// the transactions named in `keep`.
    pub async fn prune_transaction_branches(
        &self,
        naming: &BranchNaming,
        cutoff: DateTime<Utc>,
        keep: Vec<String>,
    ) -> RepositoryResult<Vec<BranchName>> {
        let naming = naming.clone();
        self.run("prune_transaction_branches", move |repo, _| {
            RefManager::prune_transaction_branches(repo, &naming, cutoff, &keep)
        })
        .await
    }

    // ==================== Content Operations ====================

    /// Stage everything and commit onto the checked-out branch.
    ///
    /// Returns `None` when there was nothing to commit.
    pub async fn commit_all(&self, message: impl Into<String>) -> RepositoryResult<Option<CommitId>> {
        let message = message.into();
        self.run("commit", move |repo, inner| {
            commit::commit_all(repo, &message, &inner.signature)
        })
        .await
    }

    /// Merge a local branch into main with a merge commit.
    pub async fn merge(&self, branch: &BranchName, message: impl Into<String>) -> RepositoryResult<MergeOutcome> {
        let branch = branch.clone();
        let message = message.into();
        self.run("merge", move |repo, inner| {
            commit::merge_into_main(repo, &branch, &message, &inner.signature)
        })
        .await
    }

    /// Force main's checkout back to its tip: check out main, drop index and
    /// working tree changes, delete untracked files.
    ///
    /// Returns how many paths were discarded.
    pub async fn reset_to_main(&self) -> RepositoryResult<usize> {
        self.run("reset_to_main", |repo, inner| {
            let main = BranchName::main();
            if !RefManager::branch_exists(repo, &main) {
                return Err(RepositoryError::MainMissing(inner.workdir.clone()));
            }
            RefManager::checkout_branch(repo, &main, true)?;
            commit::discard_changes(repo)
        })
        .await
    }

    // ==================== Remote Operations ====================

    /// Clone this repository into `dest`, checked out on `branch`.
    pub async fn clone_to(&self, dest: impl Into<PathBuf>, branch: &BranchName) -> RepositoryResult<RepositoryController> {
        let dest = dest.into();
        let branch = branch.clone();
        self.run("clone", move |_, inner| {
            let clone = remote::clone_branch(&inner.workdir, &dest, &branch)?;
            Self::from_repository(clone, inner.signature.clone())
        })
        .await
    }

    /// Fetch `branch` from `remote` (a remote name or path) into local branch `into`.
    pub async fn fetch(&self, remote: impl Into<String>, branch: &BranchName, into: &BranchName) -> RepositoryResult<()> {
        let remote = remote.into();
        let branch = branch.clone();
        let into = into.clone();
        self.run("fetch", move |repo, _| remote::fetch_branch(repo, &remote, &branch, &into))
            .await
    }

    /// Push a local branch to `remote` (a remote name or path).
    pub async fn push(&self, remote: impl Into<String>, branch: &BranchName) -> RepositoryResult<()> {
        let remote = remote.into();
        let branch = branch.clone();
        self.run("push", move |repo, _| remote::push_branch(repo, &remote, &branch))
            .await
    }

    // ==================== Recovery ====================

    /// Delete lock files an interrupted git command left in the `.git` directory.
    pub fn remove_stale_git_locks(git_dir: &Path) -> RepositoryResult<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for name in GIT_INTERNAL_LOCKS {
            let path = git_dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {
                    warn!(path = %path.display(), "removed stale git lock");
                    removed.push(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for RepositoryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryController")
            .field("path", &self.inner.workdir)
            .finish()
    }
}

/// Run blocking repository or filesystem work on tokio's blocking pool.
pub(crate) async fn run_blocking<F, T>(operation: &'static str, f: F) -> RepositoryResult<T>
where
    F: FnOnce() -> RepositoryResult<T> + Send + 'static,
    T: Send + 'static,
{
    debug!(operation, "dispatching blocking call");
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RepositoryError::Background {
            operation,
            reason: e.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, RepositoryController) {
        let dir = TempDir::new().unwrap();
        let repo = RepositoryController::open_or_init(dir.path(), GitSignature::default())
            .await
            .unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn test_init_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/db");

        let repo = RepositoryController::open_or_init(&path, GitSignature::default())
            .await
            .unwrap();
        let head1 = repo.head().await.unwrap();
        drop(repo);

        let repo = RepositoryController::open(&path, GitSignature::default()).await.unwrap();
        assert_eq!(repo.head().await.unwrap(), head1);
        assert_eq!(repo.current_branch().await.unwrap().as_deref(), Some("main"));
        assert!(repo.is_clean().await.unwrap());
    }

    #[tokio::test]
    async fn test_open_missing_repository() {
        let dir = TempDir::new().unwrap();
        let result = RepositoryController::open(dir.path(), GitSignature::default()).await;
        assert!(matches!(result, Err(RepositoryError::NotARepository(_))));
    }

    #[tokio::test]
    async fn test_open_renames_legacy_trunk() {
        let dir = TempDir::new().unwrap();
        {
            let mut opts = RepositoryInitOptions::new();
            opts.initial_head("master");
            let repo = Repository::init_opts(dir.path(), &opts).unwrap();
            commit::create_initial_commit(&repo, dir.path(), &GitSignature::default()).unwrap();
        }

        let repo = RepositoryController::open(dir.path(), GitSignature::default()).await.unwrap();
        let branches = repo.list_branches(None).await.unwrap();
        assert_eq!(branches, vec![BranchName::main()]);
        repo.ensure_clean_main().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_clean_main_rejects_dirty_tree() {
        let (dir, repo) = setup().await;
        fs::write(dir.path().join("stray.yaml"), "x: 1\n").unwrap();

        match repo.ensure_clean_main().await {
            Err(RepositoryError::DirtyWorkingTree { changes, .. }) => {
                assert_eq!(changes, vec![PathBuf::from("stray.yaml")]);
            }
            other => panic!("expected dirty working tree, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ensure_clean_main_rejects_other_branch() {
        let (_dir, repo) = setup().await;
        let branch = BranchName::new("elsewhere").unwrap();
        repo.create_branch(&branch).await.unwrap();
        repo.checkout(&branch).await.unwrap();

        let result = repo.ensure_clean_main().await;
        assert!(matches!(result, Err(RepositoryError::NotOnMain { .. })));
    }

    #[tokio::test]
    async fn test_clone_commit_fetch_merge() {
        let (dir, origin) = setup().await;
        let branch = BranchName::new("transaction-abc-20240101-000000").unwrap();
        origin.create_branch(&branch).await.unwrap();

        let clone_dir = TempDir::new().unwrap();
        let clone = origin.clone_to(clone_dir.path().join("wc"), &branch).await.unwrap();
        fs::write(clone.path().join("x"), "x=1").unwrap();
        assert!(clone.commit_all("set x").await.unwrap().is_some());

        origin
            .fetch(clone.path().to_string_lossy(), &branch, &branch)
            .await
            .unwrap();
        let outcome = origin.merge(&branch, "Transaction abc: test").await.unwrap();
        let merge = origin.get_commit(outcome.commit().unwrap()).await.unwrap();
        assert!(merge.is_merge());
        assert_eq!(fs::read_to_string(dir.path().join("x")).unwrap(), "x=1");
        assert!(origin.is_clean().await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_to_main_discards_everything() {
        let (dir, repo) = setup().await;
        let branch = BranchName::new("elsewhere").unwrap();
        repo.create_branch(&branch).await.unwrap();
        repo.checkout(&branch).await.unwrap();
        fs::write(dir.path().join("junk"), "junk").unwrap();

        let discarded = repo.reset_to_main().await.unwrap();
        assert_eq!(discarded, 1);
        repo.ensure_clean_main().await.unwrap();
    }

    #[tokio::test]
    async fn test_seal_rollback_branch_once() {
        let (_dir, repo) = setup().await;
        let branch = BranchName::new("transaction-abc-20240101-000000").unwrap();
        repo.create_branch(&branch).await.unwrap();

        assert!(!repo.is_rollback_branch(&branch).await.unwrap());
        assert!(repo.seal_rollback_branch(&branch).await.unwrap().is_some());
        assert!(repo.is_rollback_branch(&branch).await.unwrap());
        assert!(repo.seal_rollback_branch(&branch).await.unwrap().is_none());
        let tip = repo.history(&branch, 1).await.unwrap();
        assert_eq!(tip[0].summary(), ROLLBACK_CHECKPOINT_MESSAGE);
    }

    #[test]
    fn test_remove_stale_git_locks() {
        let dir = TempDir::new().unwrap();
        let repo = RepositoryController::open_or_init_blocking(dir.path(), GitSignature::default()).unwrap();
        fs::write(repo.git_dir().join("index.lock"), "").unwrap();

        let removed = RepositoryController::remove_stale_git_locks(repo.git_dir()).unwrap();
        assert_eq!(removed, vec![repo.git_dir().join("index.lock")]);
        assert!(RepositoryController::remove_stale_git_locks(repo.git_dir())
            .unwrap()
            .is_empty());
    }
}
