//! The per-repository write lock.
//!
//! A marker file inside the `.git` directory names the one transaction
//! allowed to write. Creation uses `create_new`, so two processes racing for
//! the lock cannot both win. The lock is advisory: only this crate honours it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::repository::{RepositoryError, RepositoryResult};
use crate::transaction::error::{ConcurrencyError, TransactionResult};

/// What the lock file says about its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub transaction_id: String,
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl LockRecord {
    fn for_current_process(transaction_id: &str) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            acquired_at: Some(Utc::now()),
            pid: Some(std::process::id()),
        }
    }

    /// Parse lock file contents. A bare transaction id is accepted too.
    fn parse(contents: &str) -> Option<Self> {
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str(trimmed) {
            Ok(record) => Some(record),
            Err(_) => Some(Self {
                transaction_id: trimmed.to_string(),
                acquired_at: None,
                pid: None,
            }),
        }
    }
}

/// Write lock for one repository.
#[derive(Debug, Clone)]
pub struct WriteLock {
    repository: PathBuf,
    path: PathBuf,
}

impl WriteLock {
    pub fn new(repository: impl Into<PathBuf>, git_dir: &Path, filename: &str) -> Self {
        Self {
            repository: repository.into(),
            path: git_dir.join(filename),
        }
    }

    /// Path of the marker file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Current owner, if the lock is held.
    pub fn holder(&self) -> RepositoryResult<Option<LockRecord>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(LockRecord::parse(&contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lock for `transaction_id`.
    ///
    /// Succeeds without change if the same transaction already holds it.
    pub fn acquire(&self, transaction_id: &str) -> TransactionResult<()> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = self
                    .holder()?
                    .map(|record| record.transaction_id)
                    .unwrap_or_else(|| "unknown".to_string());
                if holder == transaction_id {
                    debug!(transaction_id, "write lock already held by this transaction");
                    return Ok(());
                }
                return Err(ConcurrencyError::WriteLockHeld {
                    repository: self.repository.clone(),
                    holder,
                }
                .into());
            }
            Err(e) => return Err(RepositoryError::from(e).into()),
        };

        let record = LockRecord::for_current_process(transaction_id);
        let written = serde_json::to_vec(&record)
            .map_err(RepositoryError::from)
            .and_then(|bytes| {
                file.write_all(&bytes)?;
                file.sync_all()?;
                Ok(())
            });
        if let Err(e) = written {
            // an empty marker would block everyone
            let _ = fs::remove_file(&self.path);
            return Err(e.into());
        }

        info!(transaction_id, lock = %self.path.display(), "acquired write lock");
        Ok(())
    }

    /// Remove the marker. Releasing a free lock is not an error.
    ///
    /// Returns true when a marker was removed.
    pub fn release(&self) -> RepositoryResult<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(lock = %self.path.display(), "released write lock");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release only if `transaction_id` is the holder.
    pub fn release_if_owned(&self, transaction_id: &str) -> RepositoryResult<bool> {
        match self.holder()? {
            Some(record) if record.transaction_id == transaction_id => self.release(),
            Some(record) => {
                warn!(
                    transaction_id,
                    holder = %record.transaction_id,
                    "write lock belongs to another transaction, leaving it"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }
}
