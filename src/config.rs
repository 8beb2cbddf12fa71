//! Engine configuration.
//!
//! Supports layered configuration from multiple sources (highest priority first):
//! 1. Local override: `.git/teapot/config.toml` (per-repo, per-user)
//! 2. User global: `~/.config/teapot/config.toml` (personal defaults)
//!
//! Hosts embedding the engine can also construct an `EngineConfig` directly
//! and skip file loading entirely. Configuration uses TOML format for
//! readability.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default time-to-live for a persisted execution context (24 hours).
fn default_context_ttl_ms() -> i64 {
    24 * 60 * 60 * 1000
}

/// Default age at which an execution lock is considered stale (5 minutes).
fn default_stale_lock_ms() -> i64 {
    5 * 60 * 1000
}

/// Default number of attempts when acquiring the cross-process lock.
fn default_lock_attempts() -> u32 {
    10
}

/// Default number of attempts for version-conflicted session updates.
fn default_session_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Engine-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a persisted execution context stays valid. Must be positive.
    #[serde(default = "default_context_ttl_ms")]
    pub context_ttl_ms: i64,

    /// Age past which an execution lock held by a dead or absent process
    /// may be broken.
    #[serde(default = "default_stale_lock_ms")]
    pub stale_lock_ms: i64,

    /// Attempts before lock acquisition gives up with a typed error.
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,

    /// Attempts before a version-conflicted session update is surfaced.
    #[serde(default = "default_session_retries")]
    pub session_retries: u32,

    /// Run Git operations in a temporary detached-HEAD worktree instead of
    /// the user's active worktree.
    #[serde(default = "default_true")]
    pub temp_worktrees: bool,

    /// Override for the session store file. Defaults to
    /// `<data_dir>/teapot/sessions.json`.
    #[serde(default)]
    pub session_store_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_ttl_ms: default_context_ttl_ms(),
            stale_lock_ms: default_stale_lock_ms(),
            lock_attempts: default_lock_attempts(),
            session_retries: default_session_retries(),
            temp_worktrees: default_true(),
            session_store_path: None,
        }
    }
}

impl EngineConfig {
    /// Validate invariants that serde defaults cannot express.
    ///
    /// A non-positive TTL would make every context stale the moment it is
    /// written, so it is rejected up front rather than at first use.
    pub fn validate(&self) -> Result<()> {
        if self.context_ttl_ms <= 0 {
            bail!("context_ttl_ms must be positive, got {}", self.context_ttl_ms);
        }
        if self.stale_lock_ms <= 0 {
            bail!("stale_lock_ms must be positive, got {}", self.stale_lock_ms);
        }
        if self.lock_attempts == 0 {
            bail!("lock_attempts must be at least 1");
        }
        Ok(())
    }

    /// Construct a config with a specific TTL, validating it immediately.
    pub fn with_context_ttl_ms(ttl_ms: i64) -> Result<Self> {
        let config = Self {
            context_ttl_ms: ttl_ms,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Load layered configuration for a repository.
    ///
    /// Later layers override earlier ones field by field; missing files are
    /// skipped silently, unreadable TOML is an error.
    pub fn load_layered(git_dir: &Path) -> Result<Self> {
        let mut merged = toml::value::Table::new();

        let mut layers: Vec<PathBuf> = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            layers.push(config_dir.join("teapot").join("config.toml"));
        }
        layers.push(git_dir.join("teapot").join("config.toml"));

        for path in layers {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config at {:?}", path))?;
            let table: toml::value::Table = toml::from_str(&raw)
                .with_context(|| format!("Config file is not valid TOML: {:?}", path))?;
            for (key, value) in table {
                merged.insert(key, value);
            }
        }

        let config: EngineConfig = toml::Value::Table(merged)
            .try_into()
            .context("Config file has invalid field types")?;
        config.validate()?;
        Ok(config)
    }
}
