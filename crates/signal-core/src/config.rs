//! Engine configuration.
//!
//! All tunables the core consumes from its embedding application live in
//! [`EngineConfig`]: lane count, per-message size budget, idle-connection
//! threshold, sweep/purge cadence, and the bounded-close ceiling. There are no
//! process-wide singletons; an `EngineConfig` is passed explicitly to the
//! scheduler, the timer manager, and the auditor at construction.
//!
//! Values can be built programmatically with the `with_*` setters or pulled
//! from the environment with [`EngineConfig::from_env`].

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of processing lanes.
pub const DEFAULT_LANE_COUNT: usize = 8;
/// Default per-message byte budget (headers + body).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
/// Default idle threshold before a tracked connection is evicted.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(120);
/// Default interval between idle sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Default interval between purges of finished timer bookkeeping.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);
/// Default hard ceiling on one connection close attempt.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default cap on connections examined in one sweep.
pub const DEFAULT_MAX_SWEEP_ITERATIONS: usize = 10_000;

/// Configuration for the signaling core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of call-affinity lanes. Fixed for the process lifetime.
    pub lane_count: usize,

    /// Maximum total bytes (header block + body) of one framed message.
    /// Exceeding it is fatal for the connection.
    pub max_message_size: usize,

    /// How long a tracked connection may stay inactive before the auditor
    /// evicts it.
    pub idle_threshold: Duration,

    /// Cadence of the idle-connection sweep.
    pub sweep_interval: Duration,

    /// Cadence of the purge that drops finished timer bookkeeping entries.
    pub purge_interval: Duration,

    /// Hard wait ceiling for one asynchronous connection close.
    pub close_timeout: Duration,

    /// Upper bound on tracked connections examined per sweep.
    pub max_sweep_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lane_count: DEFAULT_LANE_COUNT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_sweep_iterations: DEFAULT_MAX_SWEEP_ITERATIONS,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, then apply any `SIGSTREAM_*` environment overrides.
    ///
    /// Recognized variables: `SIGSTREAM_LANE_COUNT`,
    /// `SIGSTREAM_MAX_MESSAGE_SIZE`, `SIGSTREAM_IDLE_THRESHOLD_SECS`,
    /// `SIGSTREAM_SWEEP_INTERVAL_SECS`, `SIGSTREAM_PURGE_INTERVAL_SECS`.
    /// Unparsable values are ignored in favor of the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = read_env_usize("SIGSTREAM_LANE_COUNT") {
            config.lane_count = n;
        }
        if let Some(n) = read_env_usize("SIGSTREAM_MAX_MESSAGE_SIZE") {
            config.max_message_size = n;
        }
        if let Some(secs) = read_env_u64("SIGSTREAM_IDLE_THRESHOLD_SECS") {
            config.idle_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env_u64("SIGSTREAM_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env_u64("SIGSTREAM_PURGE_INTERVAL_SECS") {
            config.purge_interval = Duration::from_secs(secs);
        }
        config
    }

    /// Set the lane count.
    pub fn with_lane_count(mut self, lane_count: usize) -> Self {
        self.lane_count = lane_count;
        self
    }

    /// Set the per-message byte budget.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set the idle-connection threshold.
    pub fn with_idle_threshold(mut self, idle_threshold: Duration) -> Self {
        self.idle_threshold = idle_threshold;
        self
    }

    /// Set the idle-sweep cadence.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Set the timer bookkeeping purge cadence.
    pub fn with_purge_interval(mut self, purge_interval: Duration) -> Self {
        self.purge_interval = purge_interval;
        self
    }

    /// Set the bounded-close ceiling.
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Set the per-sweep iteration cap.
    pub fn with_max_sweep_iterations(mut self, max_sweep_iterations: usize) -> Self {
        self.max_sweep_iterations = max_sweep_iterations;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.lane_count == 0 {
            return Err(Error::InvalidConfig("lane_count must be > 0".into()));
        }
        if self.max_message_size == 0 {
            return Err(Error::InvalidConfig("max_message_size must be > 0".into()));
        }
        if self.close_timeout.is_zero() {
            return Err(Error::InvalidConfig("close_timeout must be > 0".into()));
        }
        Ok(())
    }
}

fn read_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn read_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
