//! Engine configuration.
//!
//! Defaults can be overridden from a TOML file and then from `GIT_LAYER_*`
//! environment variables, e.g. `GIT_LAYER_CLEANUP_OLD_BRANCHES_HOURS=48`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::repository::{BranchNaming, GitSignature};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "GIT_LAYER_";

/// Upper bound for `cleanup_old_branches_hours` (about a century).
pub const MAX_CLEANUP_OLD_BRANCHES_HOURS: u32 = 876_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Author and committer name for every commit the engine makes.
    pub git_user_name: String,
    pub git_user_email: String,
    pub transaction_branch_prefix: String,
    pub failure_branch_prefix: String,
    /// Retention window for transaction and rollback branches during recovery.
    pub cleanup_old_branches_hours: u32,
    pub temp_clone_prefix: String,
    /// Lock file name inside the `.git` directory.
    pub write_lock_filename: String,
    /// Remote that main, failure and rollback branches are pushed to.
    /// Nothing is pushed when unset.
    pub upstream_remote: Option<String>,
    /// Default tracing filter for the binary when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            git_user_name: "AI-DB System".to_string(),
            git_user_email: "ai-db@localhost".to_string(),
            transaction_branch_prefix: "transaction".to_string(),
            failure_branch_prefix: "failed-transaction".to_string(),
            cleanup_old_branches_hours: 24,
            temp_clone_prefix: "git-layer-".to_string(),
            write_lock_filename: "ai-db-write.lock".to_string(),
            upstream_remote: None,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cleanup_old_branches_hours > MAX_CLEANUP_OLD_BRANCHES_HOURS {
            return Err(ConfigError::InvalidValue {
                key: "cleanup_old_branches_hours".to_string(),
                value: self.cleanup_old_branches_hours.to_string(),
            });
        }
        Ok(())
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Apply `GIT_LAYER_*` overrides. Unknown keys are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let Some(field) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.into();
            match field.to_ascii_lowercase().as_str() {
                "git_user_name" => self.git_user_name = value,
                "git_user_email" => self.git_user_email = value,
                "transaction_branch_prefix" => self.transaction_branch_prefix = value,
                "failure_branch_prefix" => self.failure_branch_prefix = value,
                "cleanup_old_branches_hours" => {
                    self.cleanup_old_branches_hours = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                        key: key.as_ref().to_string(),
                        value: value.clone(),
                    })?;
                }
                "temp_clone_prefix" => self.temp_clone_prefix = value,
                "write_lock_filename" => self.write_lock_filename = value,
                "upstream_remote" => {
                    self.upstream_remote = if value.trim().is_empty() { None } else { Some(value) };
                }
                "log_level" => self.log_level = value,
                _ => {}
            }
        }
        self.validate()
    }

    pub fn naming(&self) -> BranchNaming {
        BranchNaming::new(&self.transaction_branch_prefix, &self.failure_branch_prefix)
    }

    pub fn signature(&self) -> GitSignature {
        GitSignature::new(&self.git_user_name, &self.git_user_email)
    }

    /// How long transaction branches are kept before recovery prunes them.
    ///
    /// `None` when the window does not fit a `Duration`.
    pub fn retention(&self) -> Option<chrono::Duration> {
        chrono::Duration::try_hours(i64::from(self.cleanup_old_branches_hours))
    }
}
