//! Tracks which repositories have an active transaction.
//!
//! The registry belongs to an [`Engine`](crate::transaction::Engine) and is
//! shared by reference with every transaction it starts. It is what rejects
//! a nested `begin` on a repository; cross-process exclusion is the write
//! lock's job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::transaction::error::ConcurrencyError;

/// Registry entry for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTransaction {
    pub transaction_id: String,
    pub started_at: DateTime<Utc>,
    pub write_escalated: bool,
}

/// Thread-safe: can be shared across tasks via Clone (uses Arc internally).
#[derive(Debug, Clone, Default)]
pub struct TransactionRegistry {
    active: Arc<RwLock<HashMap<PathBuf, ActiveTransaction>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `transaction_id` as active on `repository`.
    pub fn register(&self, repository: &Path, transaction_id: &str) -> Result<(), ConcurrencyError> {
        let mut active = self.active.write();
        if let Some(existing) = active.get(repository) {
            return Err(ConcurrencyError::NestedTransaction {
                repository: repository.to_path_buf(),
                active: existing.transaction_id.clone(),
            });
        }
        active.insert(
            repository.to_path_buf(),
            ActiveTransaction {
                transaction_id: transaction_id.to_string(),
                started_at: Utc::now(),
                write_escalated: false,
            },
        );
        Ok(())
    }

    pub fn mark_escalated(&self, repository: &Path, transaction_id: &str) {
        if let Some(entry) = self.active.write().get_mut(repository) {
            if entry.transaction_id == transaction_id {
                entry.write_escalated = true;
            }
        }
    }

    /// Remove the entry if it still belongs to `transaction_id`.
    pub fn unregister(&self, repository: &Path, transaction_id: &str) -> bool {
        let mut active = self.active.write();
        match active.get(repository) {
            Some(entry) if entry.transaction_id == transaction_id => {
                active.remove(repository);
                true
            }
            _ => false,
        }
    }

    /// Remove whatever entry `repository` has.
    pub fn clear(&self, repository: &Path) -> Option<ActiveTransaction> {
        self.active.write().remove(repository)
    }

    pub fn active(&self, repository: &Path) -> Option<ActiveTransaction> {
        self.active.read().get(repository).cloned()
    }

    /// Ids of every active transaction, across repositories.
    pub fn active_ids(&self) -> Vec<String> {
        self.active
            .read()
            .values()
            .map(|entry| entry.transaction_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty()
    }
}
