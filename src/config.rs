use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::WaitOptions;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub watcher: WatcherConfig,
    pub wait: WaitDefaults,
}

/// Timing of the watcher's polling loops
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatcherConfig {
    /// Delay between lookups while waiting for the process to appear
    pub poll_interval_ms: u64,
    /// Delay between window checks while waiting for the process's window
    pub window_poll_interval_ms: u64,
    /// Longest single block on process exit before re-resolving
    pub exit_block_interval_ms: u64,
    /// Buffered "process closed" events per subscriber
    pub event_capacity: usize,
    pub window_retry: RetryPolicy,
}

/// How the window wait restarts after losing track of the process
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Give up after this many restarts; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Pause before the first restart, doubled on each following one
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Wait options used when the CLI flags don't say otherwise
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct WaitDefaults {
    pub wait_for_exit: bool,
    pub wait_for_window: bool,
    pub timeout_ms: Option<u64>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 888,
            window_poll_interval_ms: 200,
            exit_block_interval_ms: 888,
            event_capacity: 16,
            window_retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff_ms: 0,
            max_backoff_ms: 8_000,
        }
    }
}

impl Config {
    /// Load the first readable config file, falling back to defaults
    pub fn load() -> Self {
        let paths = [
            dirs::config_dir().map(|p| p.join("process-lurker/config.toml")),
            dirs::home_dir().map(|p| p.join(".process-lurker.toml")),
            Some(PathBuf::from("process-lurker.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!(
                            event = "config.load_failed",
                            path = %path.display(),
                            error = %format!("{e:#}")
                        );
                    }
                }
            }
        }

        Config::default()
    }

    /// Load and validate a specific config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.watcher.validate()
    }
}

impl WatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            bail!("watcher.poll_interval_ms must be greater than zero");
        }
        if self.window_poll_interval_ms == 0 {
            bail!("watcher.window_poll_interval_ms must be greater than zero");
        }
        if self.exit_block_interval_ms == 0 {
            bail!("watcher.exit_block_interval_ms must be greater than zero");
        }
        if self.event_capacity == 0 {
            bail!("watcher.event_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn window_poll_interval(&self) -> Duration {
        Duration::from_millis(self.window_poll_interval_ms)
    }

    pub fn exit_block_interval(&self) -> Duration {
        Duration::from_millis(self.exit_block_interval_ms)
    }
}

impl RetryPolicy {
    /// Whether restart number `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Pause before restart number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.initial_backoff_ms == 0 || attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

impl WaitDefaults {
    pub fn to_options(&self) -> WaitOptions {
        WaitOptions {
            wait_for_exit: self.wait_for_exit,
            wait_for_window: self.wait_for_window,
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}
