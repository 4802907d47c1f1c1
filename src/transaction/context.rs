//! The transaction state machine.
//!
//! ```text
//! Inactive ──begin──► ReadOnly ──write_escalation_required──► WriteEscalated
//!                        │                                      │      │
//!                        │                      operation_failed│      │
//!                        │                                      ▼      │
//!                        │                                   Failed    │
//!                        │                                      │      │
//!                        └──commit/rollback──► Committed | RolledBack ◄┘
//! ```
//!
//! A transaction reads from the main checkout until it first needs to
//! write. Escalation takes the repository's write lock, creates a branch
//! from main and moves the transaction into a private clone of that branch.
//! Commit merges the branch back into main; rollback keeps it for forensics
//! and leaves main alone.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::repository::{
    branch_timestamp, run_blocking, BranchName, CommitId, RepositoryController, RepositoryError, RepositoryResult,
    ROLLBACK_CHECKPOINT_MESSAGE,
};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::lock::WriteLock;
use crate::transaction::registry::TransactionRegistry;
use crate::transaction::working_copy::WorkingCopy;

const FINAL_CHECKPOINT_MESSAGE: &str = "Final checkpoint before merge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Inactive,
    ReadOnly,
    WriteEscalated,
    /// Escalated, then an operation failed. Only rollback is valid.
    Failed,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Inactive => "inactive",
            TransactionState::ReadOnly => "read-only",
            TransactionState::WriteEscalated => "write-escalated",
            TransactionState::Failed => "failed",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled-back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transaction against one repository.
///
/// Created by [`Engine::begin`](crate::transaction::Engine::begin). Must be
/// finished with [`commit`](Self::commit) or [`rollback`](Self::rollback);
/// dropping it earlier releases everything it holds and logs a warning.
pub struct Transaction {
    id: String,
    message: String,
    repository_path: PathBuf,
    origin: RepositoryController,
    working_copy: WorkingCopy,
    branch: Option<BranchName>,
    lock: WriteLock,
    state: TransactionState,
    registry: TransactionRegistry,
    config: Arc<EngineConfig>,
}

impl Transaction {
    pub(crate) fn new(
        id: String,
        message: String,
        repository_path: PathBuf,
        origin: RepositoryController,
        registry: TransactionRegistry,
        config: Arc<EngineConfig>,
    ) -> Self {
        let lock = WriteLock::new(&repository_path, origin.git_dir(), &config.write_lock_filename);
        Self {
            id,
            message,
            working_copy: WorkingCopy::main(&repository_path),
            repository_path,
            origin,
            branch: None,
            lock,
            state: TransactionState::Inactive,
            registry,
            config,
        }
    }

    pub(crate) fn activate(&mut self) {
        self.state = TransactionState::ReadOnly;
        info!(tx_id = %self.id, repository = %self.repository_path.display(), "transaction started");
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The directory to read and write: the main checkout until escalation,
    /// the private clone after.
    pub fn path(&self) -> &Path {
        self.working_copy.path()
    }

    pub fn repository_path(&self) -> &Path {
        &self.repository_path
    }

    /// The transaction branch, once escalated.
    pub fn branch(&self) -> Option<&BranchName> {
        self.branch.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Not yet committed or rolled back.
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal() && self.state != TransactionState::Inactive
    }

    pub fn is_write_escalated(&self) -> bool {
        self.state == TransactionState::WriteEscalated
    }

    fn invalid(&self, operation: &'static str) -> TransactionError {
        TransactionError::InvalidState {
            tx_id: self.id.clone(),
            state: self.state.to_string(),
            operation,
        }
    }

    /// Clone repository and branch of an escalated transaction.
    fn escalated_parts(&self, operation: &'static str) -> TransactionResult<(RepositoryController, BranchName)> {
        if self.state != TransactionState::WriteEscalated {
            return Err(self.invalid(operation));
        }
        match (self.working_copy.clone_repo(), &self.branch) {
            (Some(clone), Some(branch)) => Ok((clone.clone(), branch.clone())),
            _ => Err(TransactionError::Internal(format!(
                "transaction {} is escalated without a working copy",
                self.id
            ))),
        }
    }

    /// Swap the clone out for the main checkout and delete it.
    async fn teardown_working_copy(&mut self) -> RepositoryResult<()> {
        let main = WorkingCopy::main(&self.repository_path);
        self.replace_working_copy(main).await
    }

    async fn replace_working_copy(&mut self, next: WorkingCopy) -> RepositoryResult<()> {
        let copy = std::mem::replace(&mut self.working_copy, next);
        copy.teardown().await
    }

    async fn acquire_lock(&self) -> TransactionResult<()> {
        let lock = self.lock.clone();
        let tx_id = self.id.clone();
        run_blocking("acquire write lock", move || Ok(lock.acquire(&tx_id))).await?
    }

    async fn release_lock(&self) -> RepositoryResult<bool> {
        let lock = self.lock.clone();
        run_blocking("release write lock", move || lock.release()).await
    }

    fn finish(&mut self, state: TransactionState) {
        self.state = state;
        self.registry.unregister(&self.repository_path, &self.id);
    }

    // ==================== Escalation ====================

    /// Get ready to write. The first call takes the write lock, branches off
    /// main and moves [`path`](Self::path) into a private clone; later calls
    /// do nothing.
    pub async fn write_escalation_required(&mut self) -> TransactionResult<()> {
        match self.state {
            TransactionState::WriteEscalated => return Ok(()),
            TransactionState::ReadOnly => {}
            _ => return Err(self.invalid("escalate")),
        }

        self.acquire_lock().await?;
        if let Err(e) = self.escalate().await {
            self.undo_escalation().await;
            return Err(e);
        }

        self.state = TransactionState::WriteEscalated;
        self.registry.mark_escalated(&self.repository_path, &self.id);
        info!(
            tx_id = %self.id,
            branch = %self.branch.as_ref().map(BranchName::as_str).unwrap_or_default(),
            clone = %self.working_copy.path().display(),
            "transaction escalated to write"
        );
        Ok(())
    }

    async fn escalate(&mut self) -> TransactionResult<()> {
        let branch = self
            .config
            .naming()
            .transaction_branch(&self.id, &branch_timestamp())
            .map_err(RepositoryError::from)?;
        self.origin.create_branch(&branch).await?;
        self.branch = Some(branch.clone());

        self.working_copy = WorkingCopy::clone_from(&self.origin, &branch, &self.config.temp_clone_prefix).await?;
        Ok(())
    }

    async fn undo_escalation(&mut self) {
        if let Err(e) = self.teardown_working_copy().await {
            warn!(tx_id = %self.id, error = %e, "failed to remove partial working copy");
        }
        if let Some(branch) = self.branch.take() {
            if let Err(e) = self.origin.delete_branch(&branch).await {
                warn!(tx_id = %self.id, branch = %branch, error = %e, "failed to delete partial transaction branch");
            }
        }
        if let Err(e) = self.release_lock().await {
            warn!(tx_id = %self.id, error = %e, "failed to release write lock");
        }
    }

    // ==================== Operation Boundaries ====================

    /// Commit everything in the clone onto the transaction branch.
    ///
    /// Returns `None` when nothing changed since the last commit.
    pub async fn operation_complete(&mut self, message: &str) -> TransactionResult<Option<CommitId>> {
        let (clone, _) = self.escalated_parts("complete an operation in")?;
        let commit = clone.commit_all(message).await?;
        if let Some(id) = commit {
            debug!(tx_id = %self.id, commit = %id.short(), summary = message, "operation committed");
        }
        Ok(commit)
    }

    /// Like [`operation_complete`](Self::operation_complete), but a no-op on
    /// a read-only transaction.
    pub async fn checkpoint(&mut self, message: &str) -> TransactionResult<Option<CommitId>> {
        if self.state == TransactionState::ReadOnly {
            return Ok(None);
        }
        self.operation_complete(message).await
    }

    /// Preserve the clone's state on a failure branch in the repository and
    /// give up the clone. Returns the failure branch.
    ///
    /// The transaction can only be rolled back afterwards, and
    /// [`path`](Self::path) no longer points at anything writable.
    pub async fn operation_failed(&mut self, message: &str) -> TransactionResult<BranchName> {
        let (clone, branch) = self.escalated_parts("record a failed operation in")?;
        let captured = self.capture_failure(&clone, &branch, message).await;
        drop(clone);

        let closed = WorkingCopy::closed(self.working_copy.path());
        if let Err(e) = self.replace_working_copy(closed).await {
            warn!(tx_id = %self.id, error = %e, "failed to remove working copy");
        }
        self.state = TransactionState::Failed;

        let failure_branch = captured?;
        info!(tx_id = %self.id, branch = %failure_branch, reason = message, "preserved failed operation");
        Ok(failure_branch)
    }

    async fn capture_failure(
        &self,
        clone: &RepositoryController,
        branch: &BranchName,
        message: &str,
    ) -> TransactionResult<BranchName> {
        let failure_branch = self
            .config
            .naming()
            .failure_branch(&branch_timestamp(), &self.id)
            .map_err(RepositoryError::from)?;

        clone.commit_all(format!("Failed operation: {}", message)).await?;
        let source = clone.path().to_string_lossy().into_owned();
        self.origin.fetch(source.clone(), branch, &failure_branch).await?;
        self.origin.fetch(source, branch, branch).await?;

        if let Some(upstream) = &self.config.upstream_remote {
            self.origin.push(upstream.clone(), &failure_branch).await?;
        }
        Ok(failure_branch)
    }

    // ==================== Termination ====================

    /// Publish the transaction's work to main.
    ///
    /// Returns the merge commit, or `None` when main did not change. On a
    /// merge failure main is untouched and the transaction stays escalated
    /// so it can still be rolled back.
    pub async fn commit(&mut self) -> TransactionResult<Option<CommitId>> {
        match self.state {
            TransactionState::ReadOnly => {
                self.finish(TransactionState::Committed);
                info!(tx_id = %self.id, "read-only transaction committed");
                return Ok(None);
            }
            TransactionState::WriteEscalated => {}
            _ => return Err(self.invalid("commit")),
        }

        let (clone, branch) = self.escalated_parts("commit")?;
        clone.commit_all(FINAL_CHECKPOINT_MESSAGE).await?;
        self.origin
            .fetch(clone.path().to_string_lossy(), &branch, &branch)
            .await?;
        drop(clone);

        let merge_message = format!("Transaction {}: {}", self.id, self.message);
        let outcome = self
            .origin
            .merge(&branch, merge_message)
            .await
            .map_err(|source| TransactionError::MergeFailed {
                branch: branch.to_string(),
                source,
            })?;
        let merged = outcome.commit();

        // main has moved; from here on the transaction is committed
        let pushed = match &self.config.upstream_remote {
            Some(upstream) if merged.is_some() => self.origin.push(upstream.clone(), &BranchName::main()).await,
            _ => Ok(()),
        };

        if let Err(e) = self.teardown_working_copy().await {
            warn!(tx_id = %self.id, error = %e, "failed to remove working copy");
        }
        if let Err(e) = self.origin.delete_branch(&branch).await {
            warn!(tx_id = %self.id, branch = %branch, error = %e, "failed to delete transaction branch");
        }
        let released = self.release_lock().await;
        self.finish(TransactionState::Committed);

        match merged {
            Some(id) => info!(tx_id = %self.id, merge = %id.short(), "transaction committed"),
            None => info!(tx_id = %self.id, "transaction committed without changes"),
        }
        pushed?;
        released?;
        Ok(merged)
    }

    /// Abandon the transaction. Main is never touched.
    ///
    /// An escalated transaction's work is kept on its branch for inspection,
    /// capped with a rollback checkpoint so recovery never prunes it.
    pub async fn rollback(&mut self) -> TransactionResult<()> {
        match self.state {
            TransactionState::ReadOnly => {
                self.finish(TransactionState::RolledBack);
                info!(tx_id = %self.id, "read-only transaction rolled back");
                return Ok(());
            }
            TransactionState::WriteEscalated | TransactionState::Failed => {}
            _ => return Err(self.invalid("roll back")),
        }

        if let Err(e) = self.capture_rollback().await {
            warn!(tx_id = %self.id, error = %e, "failed to preserve rolled back work");
        }
        if let Err(e) = self.teardown_working_copy().await {
            warn!(tx_id = %self.id, error = %e, "failed to remove working copy");
        }
        let released = self.release_lock().await;
        self.finish(TransactionState::RolledBack);
        info!(
            tx_id = %self.id,
            branch = %self.branch.as_ref().map(BranchName::as_str).unwrap_or_default(),
            "transaction rolled back"
        );
        released?;
        Ok(())
    }

    async fn capture_rollback(&self) -> TransactionResult<()> {
        let Some(branch) = &self.branch else {
            return Ok(());
        };
        // a failed transaction's clone is already gone
        if let Some(clone) = self.working_copy.clone_repo() {
            clone.commit_all(ROLLBACK_CHECKPOINT_MESSAGE).await?;
            self.origin
                .fetch(clone.path().to_string_lossy(), branch, branch)
                .await?;
        }
        self.origin.seal_rollback_branch(branch).await?;
        if let Some(upstream) = &self.config.upstream_remote {
            self.origin.push(upstream.clone(), branch).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("repository", &self.repository_path)
            .field("path", &self.working_copy.path())
            .field("branch", &self.branch)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.is_active() {
            return;
        }
        warn!(tx_id = %self.id, state = %self.state, "transaction dropped without commit or rollback");

        // also covers an escalation cancelled after taking the lock
        if let Err(e) = self.lock.release_if_owned(&self.id) {
            warn!(tx_id = %self.id, error = %e, "failed to release write lock");
        }
        self.registry.unregister(&self.repository_path, &self.id);
        // the clone's TempDir removes itself when the working copy drops
    }
}
