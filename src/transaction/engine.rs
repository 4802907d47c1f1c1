//! Engine - the entry point for transactions.
//!
//! The engine owns the configuration and the registry of active
//! transactions. It handles:
//! - Opening (or creating) repositories and starting transactions
//! - Scoped transactions that always end in commit or rollback
//! - Crash recovery

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{error, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::recovery::{self, RecoveryReport};
use crate::repository::{RepositoryController, RepositoryResult};
use crate::transaction::context::Transaction;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::registry::TransactionRegistry;

/// Thread-safe: can be shared across tasks via Clone (uses Arc internally).
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    config: Arc<EngineConfig>,
    registry: TransactionRegistry,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                registry: TransactionRegistry::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Active transactions started by this engine.
    pub fn registry(&self) -> &TransactionRegistry {
        &self.inner.registry
    }

    /// Begin a read-only transaction on the repository at `repository_path`,
    /// creating the repository if it does not exist.
    ///
    /// Main must be checked out and clean. Only one transaction per
    /// repository may be active in an engine at a time.
    pub async fn begin(
        &self,
        repository_path: impl AsRef<Path>,
        message: Option<&str>,
    ) -> TransactionResult<Transaction> {
        let signature = self.inner.config.signature();
        let origin = RepositoryController::open_or_init(repository_path.as_ref(), signature).await?;
        let canonical = recovery::canonical_repository_path(origin.path()).await?;

        let tx_id = Ulid::new().to_string().to_lowercase();
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Transaction {}", tx_id));

        self.inner.registry.register(&canonical, &tx_id)?;
        if let Err(e) = origin.ensure_clean_main().await {
            self.inner.registry.unregister(&canonical, &tx_id);
            return Err(e.into());
        }

        let mut tx = Transaction::new(
            tx_id,
            message,
            canonical,
            origin,
            self.inner.registry.clone(),
            Arc::clone(&self.inner.config),
        );
        tx.activate();
        Ok(tx)
    }

    /// Run `f` inside a transaction: commit when it returns `Ok`, roll back
    /// when it returns `Err`.
    ///
    /// ```ignore
    /// engine
    ///     .with_transaction("./data", Some("add user"), |tx| {
    ///         Box::pin(async move {
    ///             tx.write_escalation_required().await?;
    ///             std::fs::write(tx.path().join("users.yaml"), "- alice\n").map_err(RepositoryError::from)?;
    ///             tx.operation_complete("add alice").await?;
    ///             Ok::<_, TransactionError>(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_transaction<T, E, F>(
        &self,
        repository_path: impl AsRef<Path>,
        message: Option<&str>,
        f: F,
    ) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 't>>,
        E: From<TransactionError>,
    {
        let mut tx = self.begin(repository_path, message).await?;

        let outcome = f(&mut tx).await;
        match outcome {
            Ok(value) => {
                if !tx.is_active() {
                    // the closure finished the transaction itself
                    return Ok(value);
                }
                if let Err(commit_err) = tx.commit().await {
                    if tx.is_active() {
                        if let Err(e) = tx.rollback().await {
                            error!(tx_id = %tx.id(), error = %e, "rollback after failed commit also failed");
                        }
                    }
                    return Err(commit_err.into());
                }
                Ok(value)
            }
            Err(err) => {
                if tx.is_active() {
                    if let Err(e) = tx.rollback().await {
                        warn!(tx_id = %tx.id(), error = %e, "rollback after failed operation failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// Clean up after a crashed transaction on `repository_path`.
    pub async fn recover(&self, repository_path: impl AsRef<Path>) -> RepositoryResult<RecoveryReport> {
        recovery::recover(repository_path, &self.inner.config, &self.inner.registry).await
    }
}
