// SPDX-License-Identifier: MIT

use std::sync::OnceLock;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::logging::DEFAULT_FORMAT;

/// What shutdown does about records nobody consumed before the timeout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownMode {
    #[default]
    /// Default: log a warning and report the discarded count
    BestEffort,
    /// Fail the shutdown call if any record was discarded
    DrainOrFail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Prefix of the worker thread names
    pub name: String,
    pub workers: usize,
    /// `None` waits forever
    pub shutdown_timeout: Option<Duration>,
    /// How long the drainer waits for in-flight producers after its sentinel
    pub drain_grace: Duration,
    pub shutdown_mode: ShutdownMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "drainpool".to_string(),
            workers: 4,
            shutdown_timeout: Some(Duration::from_secs(5)),
            drain_grace: Duration::from_millis(50),
            shutdown_mode: ShutdownMode::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_shutdown_mode(mut self, mode: ShutdownMode) -> Self {
        self.shutdown_mode = mode;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub pool: PoolConfig,
    /// env_logger style directives, e.g. `info,drainpool::pool=debug`
    pub filter: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::new("log-sink").with_workers(1),
            filter: "info".to_string(),
            format: DEFAULT_FORMAT.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct GlobalConfig {
    pub pool: PoolConfig,
    pub log: LogConfig,
}

// Starts empty and is set once in main().
pub static CONFIG: OnceLock<GlobalConfig> = OnceLock::new();

/// Returns false if the configuration had already been set.
pub fn initialize_global_config(pool: PoolConfig, log: LogConfig) -> bool {
    CONFIG.set(GlobalConfig { pool, log }).is_ok()
}

pub fn get_pool_config() -> PoolConfig {
    CONFIG
        .get()
        .map(|config| config.pool.clone())
        .unwrap_or_default()
}

pub fn get_log_config() -> LogConfig {
    CONFIG
        .get()
        .map(|config| config.log.clone())
        .unwrap_or_default()
}
