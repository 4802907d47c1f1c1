//! gitlayer - maintenance commands for gitlayer repositories.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use gitlayer::config::EngineConfig;
use gitlayer::repository::{BranchKind, RepositoryController};
use gitlayer::transaction::{Engine, WriteLock};

enum Command {
    Recover,
    Status,
    Branches,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse simple command line args.
    let mut command: Option<Command> = None;
    let mut repository: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(PathBuf::from(&args[i]));
                }
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("gitlayer v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            "recover" if command.is_none() => command = Some(Command::Recover),
            "status" if command.is_none() => command = Some(Command::Status),
            "branches" if command.is_none() => command = Some(Command::Branches),
            arg => {
                if !arg.starts_with('-') && command.is_some() && repository.is_none() {
                    repository = Some(PathBuf::from(arg));
                } else {
                    eprintln!("Unknown argument: {}", arg);
                    return ExitCode::FAILURE;
                }
            }
        }
        i += 1;
    }

    let (Some(command), Some(repository)) = (command, repository) else {
        print_help();
        return ExitCode::FAILURE;
    };

    let config = match config_path {
        Some(path) => EngineConfig::load(&path),
        None => EngineConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    gitlayer::logging::init(&config.log_level);

    let result = match command {
        Command::Recover => run_recover(config, &repository).await,
        Command::Status => run_status(&config, &repository).await,
        Command::Branches => run_branches(&config, &repository).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    println!("gitlayer - maintenance for git-backed transactional file trees");
    println!();
    println!("Usage: gitlayer [OPTIONS] <COMMAND> <REPOSITORY>");
    println!();
    println!("Commands:");
    println!("  recover     Clear stale locks, reset main and prune old transaction branches");
    println!("  status      Show the checkout, write lock and branch counts");
    println!("  branches    List branches by kind");
    println!();
    println!("Options:");
    println!("  -c, --config PATH      TOML config file (GIT_LAYER_* variables still apply)");
    println!("  -h, --help             Show this help message");
    println!("  --version              Show version");
}

async fn run_recover(config: EngineConfig, repository: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::new(config);
    let report = engine.recover(repository).await?;

    if report.is_clean() {
        println!("Nothing to recover.");
        return Ok(());
    }
    for lock in &report.git_locks_removed {
        println!("removed git lock      {}", lock.display());
    }
    if let Some(record) = &report.write_lock_removed {
        println!("broke write lock      {}", record.transaction_id);
    }
    if report.files_discarded > 0 {
        println!("discarded paths       {}", report.files_discarded);
    }
    for branch in &report.branches_pruned {
        println!("pruned branch         {}", branch);
    }
    Ok(())
}

async fn run_status(config: &EngineConfig, repository: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let repo = RepositoryController::open(repository, config.signature()).await?;
    let naming = config.naming();

    let current = repo.current_branch().await?;
    let head = repo.head().await?;
    let dirty = repo.dirty_paths().await?;
    let lock = WriteLock::new(repo.path(), repo.git_dir(), &config.write_lock_filename);

    println!("repository   {}", repo.path().display());
    println!("checked out  {}", current.as_deref().unwrap_or("(detached)"));
    println!("main         {}", head.short());
    if dirty.is_empty() {
        println!("working tree clean");
    } else {
        println!("working tree {} changed path(s)", dirty.len());
    }
    match lock.holder()? {
        Some(record) => println!("write lock   held by {}", record.transaction_id),
        None => println!("write lock   free"),
    }

    let branches = repo.list_branches(None).await?;
    let count = |kind: BranchKind| branches.iter().filter(|b| naming.classify(b) == kind).count();
    println!("transaction branches  {}", count(BranchKind::Transaction));
    println!("failure branches      {}", count(BranchKind::Failure));
    Ok(())
}

async fn run_branches(config: &EngineConfig, repository: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let repo = RepositoryController::open(repository, config.signature()).await?;
    let naming = config.naming();

    for branch in repo.list_branches(None).await? {
        let kind = naming.classify(&branch);
        let label = match kind {
            BranchKind::Main => "main",
            BranchKind::Transaction => {
                if repo.is_rollback_branch(&branch).await? {
                    "rollback"
                } else {
                    "transaction"
                }
            }
            BranchKind::Failure => "failure",
            BranchKind::Other => "other",
        };
        println!("{:<12} {}", label, branch);
    }
    Ok(())
}
