//! Runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How many sessions may run, and in what order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One main session receives every message; no session is ever spawned.
    #[default]
    Single,
    /// Every starter message spawns a session that runs in parallel.
    Concurrent,
    /// Spawned sessions run one at a time, in arrival order.
    Sequential,
}

/// Message-to-session matching algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationAlgorithm {
    /// Linear scan over live sessions.
    #[default]
    Simple,
    /// Index of live sessions keyed by correlation values.
    Hash,
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Housekeeping interval must be greater than zero")]
    ZeroInterval,
}

/// Runtime configuration, supplied once before any routing happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub execution_mode: ExecutionMode,
    pub correlation_algorithm: CorrelationAlgorithm,
    /// Default deadline of timed message requests, in milliseconds.
    pub response_timeout_ms: u64,
    /// Period of the expired-waiter sweep, in milliseconds.
    pub housekeeping_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            correlation_algorithm: CorrelationAlgorithm::default(),
            response_timeout_ms: 36_000 * 1000,
            housekeeping_interval_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON configuration document. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns error if the document is malformed or the interval is zero.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        if config.housekeeping_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(config)
    }

    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    #[must_use]
    pub const fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}
