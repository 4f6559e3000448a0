//! tasklane configuration
//!
//! One TOML file configures the scheduler, the job worker pool and the shared
//! arena. Every field has a default, so an empty file (or no file) is valid.
//!
//! # Configuration lookup
//!
//! ```text
//! Priority (high -> low):
//! 1. Explicit path (CLI `--config`)
//! 2. TASKLANE_CONFIG environment variable
//! 3. Default values
//! ```
//!
//! # Example
//!
//! ```toml
//! [scheduler]
//! clock = "real"
//! wait_all_forks_on_finish = true
//!
//! [jobs]
//! workers = 4
//! mode = "process"
//! queue_capacity = 128
//!
//! [arena]
//! slot_count = 32
//! slot_size = 65536
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "TASKLANE_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    #[serde(default)]
    pub arena: ArenaConfig,
}

/// Time source used by the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Monotonic wall-clock time.
    #[default]
    Real,
    /// Time only moves when every task is blocked on a timer; it then jumps
    /// straight to the next deadline.
    Virtual,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Time source.
    #[serde(default)]
    pub clock: ClockMode,
    /// Drain every still-running fork when the root computation finishes,
    /// instead of abandoning them.
    #[serde(default)]
    pub wait_all_forks_on_finish: bool,
    /// Longest single block while waiting for external (job) events, in ms.
    #[serde(default = "default_idle_slice_ms")]
    pub idle_slice_ms: u64,
}

fn default_idle_slice_ms() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            clock: ClockMode::Real,
            wait_all_forks_on_finish: false,
            idle_slice_ms: 10,
        }
    }
}

impl SchedulerConfig {
    /// Config with a virtual clock, used for deterministic timing.
    pub fn virtual_time() -> Self {
        Self {
            clock: ClockMode::Virtual,
            ..Self::default()
        }
    }

    #[inline]
    pub fn idle_slice(&self) -> Duration {
        Duration::from_millis(self.idle_slice_ms.max(1))
    }
}

/// How job workers are hosted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One child process per worker.
    #[default]
    Process,
    /// One thread per worker in this process (unix only).
    Thread,
}

/// Job worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    /// Number of workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Worker hosting.
    #[serde(default)]
    pub mode: WorkerMode,
    /// Worker executable; defaults to the current executable. It is started
    /// with `worker --arena <path> --id <n>`.
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Jobs that may wait for a free worker before `start` reports saturation.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Timeout applied when `start` is called without one, in ms.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    /// How long shutdown waits for a worker to exit, in ms.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            mode: WorkerMode::Process,
            program: None,
            queue_capacity: 64,
            default_timeout_ms: None,
            shutdown_timeout_ms: 1000,
        }
    }
}

impl JobConfig {
    #[inline]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    #[inline]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Shared arena geometry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArenaConfig {
    /// Number of context slots.
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    /// Bytes per slot; the largest publishable context.
    #[serde(default = "default_slot_size")]
    pub slot_size: u32,
    /// Directory for the arena file (system temp dir when unset). A tmpfs
    /// such as /dev/shm keeps the arena off disk.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_slot_count() -> u32 {
    64
}

fn default_slot_size() -> u32 {
    64 * 1024
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            slot_count: 64,
            slot_size: 64 * 1024,
            dir: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Config serialize error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Parse configuration from TOML text.
pub fn parse_config(content: &str) -> Result<RuntimeConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Load configuration from a file.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Load configuration from `TASKLANE_CONFIG`, or defaults when unset.
pub fn load_default_config() -> Result<RuntimeConfig, ConfigError> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => load_config(Path::new(&path)),
        None => Ok(RuntimeConfig::default()),
    }
}

/// Write configuration as TOML.
pub fn save_config(
    path: &Path,
    config: &RuntimeConfig,
) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests;
