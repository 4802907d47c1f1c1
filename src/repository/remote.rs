//! Moving branches between repositories: clone, fetch and push.
//!
//! A remote is either the name of a configured remote or a path/URL, in
//! which case an anonymous remote is used.

use std::path::Path;

use git2::build::RepoBuilder;
use git2::{Remote, Repository};
use tracing::debug;

use crate::repository::error::RepositoryResult;
use crate::repository::types::BranchName;

fn open_remote<'r>(repo: &'r Repository, remote: &str) -> RepositoryResult<Remote<'r>> {
    match repo.find_remote(remote) {
        Ok(found) => Ok(found),
        Err(e) if e.code() == git2::ErrorCode::NotFound || e.code() == git2::ErrorCode::InvalidSpec => {
            Ok(repo.remote_anonymous(remote)?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Clone `source` into `dest` with `branch` checked out.
pub fn clone_branch(source: &Path, dest: &Path, branch: &BranchName) -> RepositoryResult<Repository> {
    let url = source.to_string_lossy();
    let repo = RepoBuilder::new().branch(branch.as_str()).clone(&url, dest)?;
    debug!(source = %url, dest = %dest.display(), branch = %branch, "cloned repository");
    Ok(repo)
}

/// Fetch `branch` from `remote` into the local branch `into`, forcing the update.
pub fn fetch_branch(
    repo: &Repository,
    remote: &str,
    branch: &BranchName,
    into: &BranchName,
) -> RepositoryResult<()> {
    let mut remote_handle = open_remote(repo, remote)?;
    let refspec = format!("+{}:{}", branch.as_ref_path(), into.as_ref_path());
    remote_handle.fetch(&[refspec.as_str()], None, None)?;
    debug!(remote, %branch, %into, "fetched branch");
    Ok(())
}

/// Push the local `branch` to the same name on `remote`, forcing the update.
pub fn push_branch(repo: &Repository, remote: &str, branch: &BranchName) -> RepositoryResult<()> {
    let mut remote_handle = open_remote(repo, remote)?;
    let refspec = format!("+{}:{}", branch.as_ref_path(), branch.as_ref_path());
    remote_handle.push(&[refspec.as_str()], None)?;
    debug!(remote, %branch, "pushed branch");
    Ok(())
}
