use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::ExecutorTiming;
use crate::resolver::RetryPolicy;
use crate::transport::TransportTimeouts;

pub const DEFAULT_PLANNER_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_MAX_ITERATIONS: u32 = 25;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    pub attempts: u32,
    pub backoff_unit_ms: u64,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_unit_ms: 500,
        }
    }
}

impl ResolveConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// DevTools endpoint of an already running Chrome to attach to.
    pub debug_url: String,
    pub headless: bool,
    /// Chrome binary; `None` lets headless_chrome find one.
    pub chrome_path: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
    pub idle_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            debug_url: "http://127.0.0.1:9222".to_string(),
            headless: false,
            chrome_path: None,
            user_data_dir: None,
            idle_timeout_secs: 600,
        }
    }
}

/// Every tunable of the engine. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub planner_url: String,
    pub planner_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub max_iterations: u32,
    /// How long processing may sit in one state before the iteration counts as stuck.
    pub stuck_timeout_ms: u64,
    pub resolve: ResolveConfig,
    pub executor: ExecutorTiming,
    pub transport: TransportTimeouts,
    pub browser: BrowserConfig,
    pub state_file: Option<PathBuf>,
    pub control_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            planner_url: DEFAULT_PLANNER_URL.to_string(),
            planner_timeout_ms: 60_000,
            tick_interval_ms: 3_000,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            stuck_timeout_ms: 90_000,
            resolve: ResolveConfig::default(),
            executor: ExecutorTiming::default(),
            transport: TransportTimeouts::default(),
            browser: BrowserConfig::default(),
            state_file: None,
            control_port: 3000,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_millis(self.stuck_timeout_ms)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_millis(self.planner_timeout_ms)
    }
}
