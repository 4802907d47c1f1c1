//! Where a transaction's caller reads and writes files.
//!
//! A read-only transaction works directly in the main checkout. Once it
//! escalates, it gets a private clone in a temporary directory, checked out
//! on the transaction branch. The clone is deleted when the working copy is
//! torn down or dropped.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::repository::{run_blocking, BranchName, RepositoryController, RepositoryResult};

#[derive(Debug)]
pub enum WorkingCopy {
    /// The repository's own checkout of main.
    Main { path: PathBuf },
    /// A temporary clone. `repo` is declared first so its handle is closed
    /// before the directory goes away.
    Clone { repo: RepositoryController, dir: TempDir },
    /// Where a clone used to be. Nothing exists at `path` any more, so
    /// writes there fail instead of landing in main.
    Closed { path: PathBuf },
}

impl WorkingCopy {
    pub fn main(path: impl Into<PathBuf>) -> Self {
        WorkingCopy::Main { path: path.into() }
    }

    pub fn closed(path: impl Into<PathBuf>) -> Self {
        WorkingCopy::Closed { path: path.into() }
    }

    /// Clone `origin` into a new temporary directory on `branch`.
    pub async fn clone_from(origin: &RepositoryController, branch: &BranchName, prefix: &str) -> RepositoryResult<Self> {
        let prefix = prefix.to_string();
        let dir = run_blocking("create working copy", move || {
            Ok(tempfile::Builder::new().prefix(&prefix).tempdir()?)
        })
        .await?;
        let repo = origin.clone_to(dir.path(), branch).await?;
        debug!(clone = %dir.path().display(), branch = %branch, "created working copy");
        Ok(WorkingCopy::Clone { repo, dir })
    }

    /// The directory callers operate in.
    pub fn path(&self) -> &Path {
        match self {
            WorkingCopy::Main { path } | WorkingCopy::Closed { path } => path,
            WorkingCopy::Clone { dir, .. } => dir.path(),
        }
    }

    pub fn is_clone(&self) -> bool {
        matches!(self, WorkingCopy::Clone { .. })
    }

    /// The clone's repository, when there is one.
    pub fn clone_repo(&self) -> Option<&RepositoryController> {
        match self {
            WorkingCopy::Clone { repo, .. } => Some(repo),
            WorkingCopy::Main { .. } | WorkingCopy::Closed { .. } => None,
        }
    }

    /// Delete the clone, if any. The main checkout is never touched.
    pub async fn teardown(self) -> RepositoryResult<()> {
        let WorkingCopy::Clone { repo, dir } = self else {
            return Ok(());
        };
        drop(repo);

        let path = dir.path().to_path_buf();
        run_blocking("teardown", move || Ok(dir.close()?)).await?;
        debug!(clone = %path.display(), "removed working copy");
        Ok(())
    }
}
