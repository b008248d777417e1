//! Scheduler configuration.
//!
//! [`SchedulerConfig`] bounds how many firings may run at once and how long
//! shutdown waits for in-flight firings.  Defaults come from [`Default`];
//! the builder-style API customises individual fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker pool and shutdown settings for the job scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Firings that may run concurrently across all jobs.
    ///
    /// Default: **10**.
    pub max_concurrent_firings: usize,

    /// How long `shutdown` waits for in-flight firings, in milliseconds.
    ///
    /// Default: **5 000 ms**.
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_firings: 10,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker pool size.  Values below 1 are raised to 1.
    pub fn with_max_concurrent_firings(mut self, max: usize) -> Self {
        self.max_concurrent_firings = max;
        self
    }

    /// Set the shutdown grace period (in milliseconds).
    pub fn with_shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.shutdown_timeout_ms = ms;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Pool size actually used.
    pub fn worker_permits(&self) -> usize {
        self.max_concurrent_firings.max(1)
    }
}
