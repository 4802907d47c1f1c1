//! End-to-end transaction scenarios against real repositories on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use gitlayer::config::EngineConfig;
use gitlayer::repository::{BranchKind, BranchName, GitSignature, RepositoryController, RepositoryError};
use gitlayer::transaction::{ConcurrencyError, Engine, TransactionError, TransactionState, WriteLock};
use tempfile::TempDir;

/// Every file under `root` except the `.git` directory.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.file_name().is_some_and(|name| name == ".git") {
                continue;
            }
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                out.insert(path.strip_prefix(root).unwrap().to_path_buf(), fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

async fn open(path: &Path) -> RepositoryController {
    RepositoryController::open(path, GitSignature::default()).await.unwrap()
}

fn write_lock(path: &Path) -> WriteLock {
    WriteLock::new(path, &path.join(".git"), &EngineConfig::default().write_lock_filename)
}

async fn assert_main_clean(path: &Path) {
    let repo = open(path).await;
    repo.ensure_clean_main().await.unwrap();
}

#[tokio::test]
async fn scenario_a_commit_publishes_to_main() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();

    let mut tx = engine.begin(dir.path(), Some("set x")).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    assert_ne!(tx.path(), tx.repository_path());
    fs::write(tx.path().join("x"), "x=1").unwrap();
    assert!(tx.operation_complete("set x").await.unwrap().is_some());
    let clone_path = tx.path().to_path_buf();
    let branch = tx.branch().unwrap().clone();

    let merge = tx.commit().await.unwrap().unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert!(!clone_path.exists());
    assert!(!write_lock(dir.path()).is_held());

    let repo = open(dir.path()).await;
    assert_eq!(repo.head().await.unwrap(), merge);
    assert_eq!(fs::read_to_string(dir.path().join("x")).unwrap(), "x=1");
    assert!(!repo.branch_exists(&branch).await.unwrap());

    let info = repo.get_commit(merge).await.unwrap();
    assert!(info.is_merge());
    assert_eq!(info.summary(), format!("Transaction {}: set x", tx.id()));
    repo.ensure_clean_main().await.unwrap();
}

#[tokio::test]
async fn scenario_b_failed_operation_is_preserved() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();
    engine.begin(dir.path(), None).await.unwrap().commit().await.unwrap();
    let before = snapshot(dir.path());

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    fs::write(tx.path().join("x"), "x=1").unwrap();
    tx.operation_complete("set x").await.unwrap();
    fs::write(tx.path().join("x"), "x=2").unwrap();

    let failure = tx.operation_failed("bad value").await.unwrap();
    assert_eq!(tx.state(), TransactionState::Failed);
    assert!(failure.as_str().starts_with("failed-transaction-"));
    assert!(failure.as_str().ends_with(tx.id()));
    assert_eq!(EngineConfig::default().naming().classify(&failure), BranchKind::Failure);

    // only rollback is allowed now
    assert!(matches!(
        tx.commit().await,
        Err(TransactionError::InvalidState { .. })
    ));
    assert!(matches!(
        tx.operation_complete("more").await,
        Err(TransactionError::InvalidState { .. })
    ));
    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);

    assert!(!dir.path().join("x").exists());
    assert_eq!(snapshot(dir.path()), before);
    assert!(!write_lock(dir.path()).is_held());

    let repo = open(dir.path()).await;
    assert_eq!(
        repo.read_file(&failure, "x").await.unwrap().as_deref(),
        Some(&b"x=2"[..])
    );
    let tip = repo.history(&failure, 1).await.unwrap();
    assert_eq!(tip[0].summary(), "Failed operation: bad value");
}

#[tokio::test]
async fn failed_transaction_cannot_write_into_main() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();
    engine.begin(dir.path(), None).await.unwrap().commit().await.unwrap();

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    fs::write(tx.path().join("x"), "x=2").unwrap();
    tx.operation_failed("bad value").await.unwrap();

    assert_ne!(tx.path(), tx.repository_path());
    assert!(fs::write(tx.path().join("y"), "late").is_err());
    tx.rollback().await.unwrap();

    assert!(!dir.path().join("y").exists());
    let mut next = engine.begin(dir.path(), None).await.unwrap();
    next.rollback().await.unwrap();
}

#[tokio::test]
async fn scenario_c_sequential_writers_do_not_contend() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();

    for value in ["1", "2"] {
        let mut tx = engine.begin(dir.path(), None).await.unwrap();
        tx.write_escalation_required().await.unwrap();
        fs::write(tx.path().join("x"), value).unwrap();
        tx.operation_complete("set x").await.unwrap();
        tx.commit().await.unwrap();
    }

    assert_eq!(fs::read_to_string(dir.path().join("x")).unwrap(), "2");
    assert!(!write_lock(dir.path()).is_held());
    assert_main_clean(dir.path()).await;
}

#[tokio::test]
async fn scenario_d_recover_after_crash() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();
    engine.begin(dir.path(), None).await.unwrap().commit().await.unwrap();
    let before = snapshot(dir.path());
    let head = open(dir.path()).await.head().await.unwrap();

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    fs::write(tx.path().join("x"), "x=1").unwrap();
    tx.operation_complete("set x").await.unwrap();
    let tx_id = tx.id().to_string();
    // the process dies: nothing gets cleaned up
    std::mem::forget(tx);
    fs::write(dir.path().join(".git/index.lock"), "").unwrap();
    fs::write(dir.path().join("torn.yaml"), "a: [").unwrap();

    assert!(write_lock(dir.path()).is_held());
    let report = engine.recover(dir.path()).await.unwrap();
    assert_eq!(report.write_lock_removed.unwrap().transaction_id, tx_id);
    assert_eq!(report.registry_cleared.as_deref(), Some(tx_id.as_str()));
    assert_eq!(report.git_locks_removed.len(), 1);

    assert!(!write_lock(dir.path()).is_held());
    assert_eq!(snapshot(dir.path()), before);
    assert_eq!(open(dir.path()).await.head().await.unwrap(), head);
    assert_main_clean(dir.path()).await;

    // recovery is idempotent and the repository is usable again
    assert!(engine.recover(dir.path()).await.unwrap().is_clean());
    let mut next = engine.begin(dir.path(), None).await.unwrap();
    next.write_escalation_required().await.unwrap();
    next.rollback().await.unwrap();
}

#[tokio::test]
async fn nested_begin_is_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    let err = engine.begin(dir.path(), None).await.unwrap_err();
    assert!(matches!(
        err,
        TransactionError::Concurrency(ConcurrencyError::NestedTransaction { .. })
    ));
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn escalation_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    let path = tx.path().to_path_buf();
    let branch = tx.branch().cloned();

    tx.write_escalation_required().await.unwrap();
    assert_eq!(tx.path(), path);
    assert_eq!(tx.branch().cloned(), branch);

    let repo = open(dir.path()).await;
    let transaction_branches = repo.list_branches(Some("transaction-")).await.unwrap();
    assert_eq!(transaction_branches.len(), 1);
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn rollback_leaves_main_byte_identical() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();
    engine
        .with_transaction(dir.path(), None, |tx| {
            Box::pin(async move {
                tx.write_escalation_required().await?;
                fs::create_dir_all(tx.path().join("users")).map_err(RepositoryError::from)?;
                fs::write(tx.path().join("users/alice.yaml"), "name: alice\n").map_err(RepositoryError::from)?;
                Ok::<_, TransactionError>(())
            })
        })
        .await
        .unwrap();
    let before = snapshot(dir.path());

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    fs::remove_file(tx.path().join("users/alice.yaml")).unwrap();
    fs::write(tx.path().join("users/bob.yaml"), "name: bob\n").unwrap();
    tx.operation_complete("replace alice with bob").await.unwrap();
    fs::write(tx.path().join("scratch"), "unsaved").unwrap();
    let branch = tx.branch().unwrap().clone();
    tx.rollback().await.unwrap();

    assert_eq!(snapshot(dir.path()), before);
    assert_main_clean(dir.path()).await;

    // the rolled back work stays on the transaction branch
    let repo = open(dir.path()).await;
    assert!(repo.branch_exists(&branch).await.unwrap());
    assert_eq!(
        repo.read_file(&branch, "scratch").await.unwrap().as_deref(),
        Some(&b"unsaved"[..])
    );
    assert_eq!(repo.history(&branch, 1).await.unwrap()[0].summary(), "Rollback checkpoint");
}

#[tokio::test]
async fn read_only_transaction_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();
    engine.begin(dir.path(), None).await.unwrap().commit().await.unwrap();
    let repo = open(dir.path()).await;
    let head = repo.head().await.unwrap();

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    assert_eq!(tx.path(), tx.repository_path());
    assert!(tx.path().join(".gitignore").exists());
    assert!(!write_lock(dir.path()).is_held());
    assert!(matches!(
        tx.operation_complete("nothing").await,
        Err(TransactionError::InvalidState { .. })
    ));
    assert_eq!(tx.checkpoint("nothing").await.unwrap(), None);
    assert_eq!(tx.commit().await.unwrap(), None);

    assert_eq!(repo.head().await.unwrap(), head);
    assert_eq!(repo.list_branches(None).await.unwrap(), vec![BranchName::main()]);
}

#[tokio::test]
async fn escalated_commit_without_changes_leaves_main_alone() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();
    engine.begin(dir.path(), None).await.unwrap().commit().await.unwrap();
    let repo = open(dir.path()).await;
    let head = repo.head().await.unwrap();

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    assert_eq!(tx.operation_complete("noop").await.unwrap(), None);
    assert_eq!(tx.commit().await.unwrap(), None);

    assert_eq!(repo.head().await.unwrap(), head);
    assert_eq!(repo.list_branches(None).await.unwrap(), vec![BranchName::main()]);
}

#[tokio::test]
async fn second_engine_cannot_take_the_write_lock() {
    let dir = TempDir::new().unwrap();
    let first = Engine::default();
    let second = Engine::default();

    let mut writer = first.begin(dir.path(), None).await.unwrap();
    writer.write_escalation_required().await.unwrap();

    // readers in another engine are fine, writers are not
    let mut other = second.begin(dir.path(), None).await.unwrap();
    match other.write_escalation_required().await {
        Err(TransactionError::Concurrency(ConcurrencyError::WriteLockHeld { holder, .. })) => {
            assert_eq!(holder, writer.id());
        }
        result => panic!("expected write lock contention, got {:?}", result),
    }
    assert_eq!(other.state(), TransactionState::ReadOnly);
    assert!(write_lock(dir.path()).is_held());

    writer.commit().await.unwrap();
    other.write_escalation_required().await.unwrap();
    other.rollback().await.unwrap();
    assert!(!write_lock(dir.path()).is_held());
}

#[tokio::test]
async fn dropped_transaction_releases_everything() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    let clone_path = tx.path().to_path_buf();
    fs::write(clone_path.join("x"), "x=1").unwrap();
    drop(tx);

    assert!(!clone_path.exists());
    assert!(!write_lock(dir.path()).is_held());
    assert!(engine.registry().is_empty());
    assert!(!dir.path().join("x").exists());
    engine.begin(dir.path(), None).await.unwrap().rollback().await.unwrap();
}

#[tokio::test]
async fn merge_conflict_leaves_main_untouched() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();
    engine.begin(dir.path(), None).await.unwrap().commit().await.unwrap();

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    fs::write(tx.path().join("x"), "from transaction").unwrap();
    tx.operation_complete("set x").await.unwrap();

    // someone bypasses the engine and commits to main directly
    let repo = open(dir.path()).await;
    fs::write(dir.path().join("x"), "from outside").unwrap();
    let outside = repo.commit_all("outside write").await.unwrap().unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, TransactionError::MergeFailed { .. }));
    assert!(err.is_conflict());
    assert_eq!(tx.state(), TransactionState::WriteEscalated);
    assert_eq!(repo.head().await.unwrap(), outside);
    assert_eq!(fs::read_to_string(dir.path().join("x")).unwrap(), "from outside");

    tx.rollback().await.unwrap();
    assert!(!write_lock(dir.path()).is_held());
    assert_main_clean(dir.path()).await;
}

#[tokio::test]
async fn commit_pushes_main_to_upstream() {
    let dir = TempDir::new().unwrap();
    let upstream = TempDir::new().unwrap();
    git2::Repository::init_bare(upstream.path()).unwrap();

    let config = EngineConfig {
        upstream_remote: Some(upstream.path().to_string_lossy().into_owned()),
        ..EngineConfig::default()
    };
    let engine = Engine::new(config);

    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    fs::write(tx.path().join("x"), "x=1").unwrap();
    let merge = tx.commit().await.unwrap().unwrap();

    let mirror = git2::Repository::open_bare(upstream.path()).unwrap();
    let tip = mirror.find_branch("main", git2::BranchType::Local).unwrap();
    assert_eq!(tip.get().target().unwrap().to_string(), merge.to_string());
}

#[tokio::test]
async fn with_transaction_rolls_back_on_error() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::default();

    let result: Result<(), TransactionError> = engine
        .with_transaction(dir.path(), Some("doomed"), |tx| {
            Box::pin(async move {
                tx.write_escalation_required().await?;
                fs::write(tx.path().join("x"), "x=1").map_err(RepositoryError::from)?;
                tx.operation_complete("set x").await?;
                Err::<(), _>(TransactionError::Internal("schema violation".to_string()))
            })
        })
        .await;

    assert!(matches!(result, Err(TransactionError::Internal(_))));
    assert!(!dir.path().join("x").exists());
    assert!(!write_lock(dir.path()).is_held());
    assert!(engine.registry().is_empty());
    assert_main_clean(dir.path()).await;
}

#[tokio::test]
async fn legacy_master_trunk_is_renamed() {
    let dir = TempDir::new().unwrap();
    {
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("master");
        let repo = git2::Repository::init_opts(dir.path(), &opts).unwrap();
        let sig = git2::Signature::now("Test", "test@test.com").unwrap();
        let tree = repo.find_tree(repo.index().unwrap().write_tree().unwrap()).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "root", &tree, &[]).unwrap();
    }

    let engine = Engine::default();
    let mut tx = engine.begin(dir.path(), None).await.unwrap();
    tx.write_escalation_required().await.unwrap();
    fs::write(tx.path().join("x"), "x=1").unwrap();
    tx.commit().await.unwrap();

    let repo = open(dir.path()).await;
    assert_eq!(repo.current_branch().await.unwrap().as_deref(), Some("main"));
    assert_eq!(
        repo.read_file(&BranchName::main(), "x").await.unwrap().as_deref(),
        Some(&b"x=1"[..])
    );
}

#[tokio::test]
async fn recovery_prunes_only_abandoned_transaction_branches() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        cleanup_old_branches_hours: 0,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config);

    let mut failed = engine.begin(dir.path(), None).await.unwrap();
    failed.write_escalation_required().await.unwrap();
    fs::write(failed.path().join("x"), "bad").unwrap();
    let failure = failed.operation_failed("bad value").await.unwrap();
    let rolled_back = failed.branch().unwrap().clone();
    failed.rollback().await.unwrap();

    let mut crashed = engine.begin(dir.path(), None).await.unwrap();
    crashed.write_escalation_required().await.unwrap();
    fs::write(crashed.path().join("y"), "half").unwrap();
    crashed.operation_complete("set y").await.unwrap();
    let abandoned = crashed.branch().unwrap().clone();
    std::mem::forget(crashed);

    // branch names and commit times have one second resolution
    std::thread::sleep(std::time::Duration::from_millis(1100));

    let report = engine.recover(dir.path()).await.unwrap();
    assert_eq!(report.branches_pruned, vec![abandoned.clone()]);

    let repo = open(dir.path()).await;
    assert!(!repo.branch_exists(&abandoned).await.unwrap());
    assert!(repo.branch_exists(&failure).await.unwrap());
    assert!(repo.branch_exists(&rolled_back).await.unwrap());
    assert!(repo.is_rollback_branch(&rolled_back).await.unwrap());
}
