//! Transaction management for gitlayer.
//!
//! Transactions give a plain file tree BEGIN / COMMIT / ROLLBACK semantics
//! using git. A transaction starts read-only on the main checkout. The first
//! write escalates it: it takes the repository's write lock, gets its own
//! branch (`transaction-{id}-{timestamp}`) and a private clone where changes
//! accumulate. On commit the branch is merged into main; on rollback it is
//! kept for inspection and main is untouched.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │      (config, begin / with_transaction / recover)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │  Registry   │       │  WriteLock  │
//!  │  (context)  │       │ (in-process)│       │(cross-proc) │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         │
//!         ▼
//!  ┌─────────────┐
//!  │ WorkingCopy │
//!  └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gitlayer::transaction::Engine;
//!
//! let engine = Engine::default();
//! let mut tx = engine.begin("./data", Some("add user")).await?;
//!
//! tx.write_escalation_required().await?;
//! std::fs::write(tx.path().join("users.yaml"), "- alice\n")?;
//! tx.operation_complete("add alice").await?;
//!
//! tx.commit().await?;  // or tx.rollback().await?;
//! ```

mod context;
mod engine;
mod error;
mod lock;
mod registry;
mod working_copy;

pub use context::{Transaction, TransactionState};
pub use engine::Engine;
pub use error::{ConcurrencyError, ErrorKind, TransactionError, TransactionResult};
pub use lock::{LockRecord, WriteLock};
pub use registry::{ActiveTransaction, TransactionRegistry};
pub use working_copy::WorkingCopy;
