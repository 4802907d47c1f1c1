//! core type-safe wrappers around git primitives for the repository layer.

use std::fmt;
use std::fmt::Formatter;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use git2::Oid;

/// Format used for the timestamp component of transaction and failure branch names.
pub const BRANCH_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// This makes sure we don't accidentally pass a tree ID where a commit ID
/// is expected. The inner Oid is only accessible within the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    /// raw Oid (for internal use only)
    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated local branch name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchName(String);

impl BranchName {
    /// the canonical trunk name
    pub const MAIN: &'static str = "main";

    /// trunk name renamed to `main` when a repository is first opened
    pub const LEGACY_MAIN: &'static str = "master";

    /// create a new BranchName
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.contains("..") || name.ends_with('/') || name.starts_with('/') || name.ends_with(".lock") {
            return Err(InvalidNameError::InvalidPath(name));
        }
        if let Some((position, char)) = name
            .chars()
            .enumerate()
            .find(|(_, c)| c.is_whitespace() || c.is_control() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
        {
            return Err(InvalidNameError::InvalidCharacter { char, position });
        }
        Ok(Self(name))
    }

    /// create the main branch reference
    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    /// check if this is the trunk
    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }

    /// get the full ref path (e.g., "refs/heads/main")
    pub fn as_ref_path(&self) -> String {
        format!("refs/heads/{}", self.0)
    }

    /// get the short name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a branch is for, as far as the naming convention tells.
///
/// Rollback branches keep the transaction branch name, so they classify as
/// [`BranchKind::Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Main,
    Transaction,
    Failure,
    Other,
}

/// The naming convention for transaction and failure branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchNaming {
    transaction_prefix: String,
    failure_prefix: String,
}

impl BranchNaming {
    pub fn new(transaction_prefix: impl Into<String>, failure_prefix: impl Into<String>) -> Self {
        Self {
            transaction_prefix: transaction_prefix.into(),
            failure_prefix: failure_prefix.into(),
        }
    }

    /// `{prefix}-{tx_id}-{timestamp}`
    pub fn transaction_branch(&self, tx_id: &str, timestamp: &str) -> Result<BranchName, InvalidNameError> {
        BranchName::new(format!("{}-{}-{}", self.transaction_prefix, tx_id, timestamp))
    }

    /// `{prefix}-{timestamp}-{tx_id}`
    pub fn failure_branch(&self, timestamp: &str, tx_id: &str) -> Result<BranchName, InvalidNameError> {
        BranchName::new(format!("{}-{}-{}", self.failure_prefix, timestamp, tx_id))
    }

    pub fn classify(&self, branch: &BranchName) -> BranchKind {
        if branch.is_main() {
            BranchKind::Main
        } else if self.strip(branch, &self.failure_prefix).is_some() {
            // checked first: the default failure prefix embeds the transaction one
            BranchKind::Failure
        } else if self.strip(branch, &self.transaction_prefix).is_some() {
            BranchKind::Transaction
        } else {
            BranchKind::Other
        }
    }

    pub fn transaction_prefix(&self) -> &str {
        &self.transaction_prefix
    }

    pub fn failure_prefix(&self) -> &str {
        &self.failure_prefix
    }

    /// Split a transaction branch name into its transaction id and the
    /// time it was created.
    pub fn parse_transaction_branch<'a>(&self, branch: &'a BranchName) -> Option<(&'a str, Option<DateTime<Utc>>)> {
        if self.classify(branch) != BranchKind::Transaction {
            return None;
        }
        let rest = self.strip(branch, &self.transaction_prefix)?;
        let (tx_id, timestamp) = rest.split_once('-')?;
        Some((tx_id, parse_branch_timestamp(timestamp)))
    }

    fn strip<'a>(&self, branch: &'a BranchName, prefix: &str) -> Option<&'a str> {
        branch.as_str().strip_prefix(prefix)?.strip_prefix('-')
    }
}

impl Default for BranchNaming {
    fn default() -> Self {
        Self::new("transaction", "failed-transaction")
    }
}

/// current local time in branch-name format
pub fn branch_timestamp() -> String {
    Local::now().format(BRANCH_TIMESTAMP_FORMAT).to_string()
}

fn parse_branch_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, BRANCH_TIMESTAMP_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// git signature (author/committer info)
#[derive(Debug, Clone)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    /// create a new signature
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// convert to git2::Signature
    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::new("AI-DB System", "ai-db@localhost")
    }
}

/// error type for invalid branch names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    InvalidCharacter { char: char, position: usize },
    InvalidPath(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char.escape_debug(), position)
            }
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
        }
    }
}

impl std::error::Error for InvalidNameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_name_main() {
        let branch = BranchName::main();
        assert!(branch.is_main());
        assert_eq!(branch.as_ref_path(), "refs/heads/main");
    }

    #[test]
    fn test_branch_name_invalid() {
        assert!(BranchName::new("").is_err());
        assert!(BranchName::new("a..b").is_err());
        assert!(BranchName::new("/leading").is_err());
        assert!(BranchName::new("trailing/").is_err());
        assert!(BranchName::new("has space").is_err());
        assert!(BranchName::new("refs.lock").is_err());
        assert!(BranchName::new("feature/x").is_ok());
    }

    #[test]
    fn test_naming_classifies_branches() {
        let naming = BranchNaming::default();
        let tx = naming.transaction_branch("01hx", "20240101-120000").unwrap();
        let failed = naming.failure_branch("20240101-120000", "01hx").unwrap();

        assert_eq!(tx.as_str(), "transaction-01hx-20240101-120000");
        assert_eq!(failed.as_str(), "failed-transaction-20240101-120000-01hx");
        assert_eq!(naming.classify(&tx), BranchKind::Transaction);
        assert_eq!(naming.classify(&failed), BranchKind::Failure);
        assert_eq!(naming.classify(&BranchName::main()), BranchKind::Main);
        assert_eq!(naming.classify(&BranchName::new("feature").unwrap()), BranchKind::Other);
    }

    #[test]
    fn test_parse_transaction_branch() {
        let naming = BranchNaming::default();
        let tx = naming.transaction_branch("01hx", "20240101-120000").unwrap();
        let (tx_id, created) = naming.parse_transaction_branch(&tx).unwrap();
        assert_eq!(tx_id, "01hx");
        let expected = Local
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(created, Some(expected));

        let failed = naming.failure_branch("20240101-120000", "01hx").unwrap();
        assert!(naming.parse_transaction_branch(&failed).is_none());
    }

    #[test]
    fn test_branch_timestamp_round_trips_through_name() {
        let naming = BranchNaming::default();
        let tx = naming.transaction_branch("abc", &branch_timestamp()).unwrap();
        let (_, created) = naming.parse_transaction_branch(&tx).unwrap();
        assert!(created.is_some());
    }
}
