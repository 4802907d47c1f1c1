//! gitlayer - Git-backed transactions for plain file trees
//!
//! This crate gives a directory of files database-style BEGIN / COMMIT /
//! ROLLBACK by using a git repository as the durability and isolation
//! mechanism. `main` always holds the last committed snapshot; a writing
//! transaction works in a private clone on its own branch, and commit is a
//! merge into main.
//!
//! # Example
//!
//! ```no_run
//! use gitlayer::transaction::{Engine, TransactionError};
//! use gitlayer::repository::RepositoryError;
//!
//! # async fn run() -> Result<(), TransactionError> {
//! let engine = Engine::default();
//! let mut tx = engine.begin("./my_data", Some("add alice")).await?;
//!
//! tx.write_escalation_required().await?;
//! std::fs::write(tx.path().join("users.yaml"), "- alice\n").map_err(RepositoryError::from)?;
//! tx.operation_complete("add alice").await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod recovery;
pub mod repository;
pub mod transaction;

pub use config::{ConfigError, EngineConfig};
pub use recovery::RecoveryReport;
pub use transaction::{Engine, Transaction, TransactionError, TransactionResult, TransactionState};
