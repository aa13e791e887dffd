//! Configuration for the orchestrator and its subsystems.
//!
//! Loaded from `~/.conductor/conductor.toml`; every field has a default
//! so an absent file yields a working configuration. Branching mode,
//! retry bounds, and checkpoint retention are deliberately configuration
//! rather than constants.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::branching::BranchingMode;
use crate::{clog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where workflow records, checkpoints, and recovery logs live.
    /// Defaults to `~/.conductor/state`.
    pub data_dir: Option<String>,
    /// Maximum tasks executed concurrently during implementation.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-task execution timeout in seconds.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Bounded wait for the per-workflow state lock, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Retry attempts per failure signature before the retry strategy
    /// declines and the failure escalates.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Checkpoints older than this many days are eligible for explicit
    /// cleanup. Unset means keep everything.
    pub checkpoint_max_age_days: Option<u32>,
    /// Branch layout for new workflows.
    #[serde(default)]
    pub branching: BranchingMode,
    /// Base branch that plan and integration branches fork from.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

fn default_max_workers() -> usize {
    4
}

fn default_task_timeout_secs() -> u64 {
    1800
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_workers: default_max_workers(),
            task_timeout_secs: default_task_timeout_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            checkpoint_max_age_days: None,
            branching: BranchingMode::default(),
            base_branch: default_base_branch(),
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Resolve the data directory, expanding a leading tilde.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("state")),
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        clog_debug!(
            "Config loaded: branching={}, max_workers={}, data_dir={:?}",
            config.branching,
            config.max_workers,
            config.data_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        let data = self.data_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        if !data.exists() {
            fs::create_dir_all(&data)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
