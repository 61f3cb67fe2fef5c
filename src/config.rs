//! Core pipeline configuration.
//!
//! All tunables the pipeline consumes are gathered here and validated up
//! front: an out-of-range value is a startup error, never a mid-batch
//! surprise. Durations are carried as plain integer units so the struct
//! deserializes cleanly from a JSON config file.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} = {value} is out of range ({allowed})")]
    OutOfRange {
        field: &'static str,
        value: String,
        allowed: &'static str,
    },
}

/// Tunables consumed by the extraction core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum engine invocations per request, retries included.
    pub max_attempts: u32,
    /// Hard cap on simultaneous outstanding model-inference calls.
    pub concurrency: usize,
    /// Maximum number of cached results before eviction kicks in.
    pub cache_capacity: usize,
    /// Age after which a cached result is considered stale.
    pub cache_ttl_secs: u64,
    /// Per-call inference timeout.
    pub inference_timeout_secs: u64,
    /// First backoff delay; doubles per retry up to the cap.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    pub backoff_cap_ms: u64,
    /// Relative arithmetic tolerance (fraction of the total's magnitude).
    pub rel_tolerance: f64,
    /// Absolute arithmetic tolerance in minor units.
    pub abs_tolerance: f64,
    /// An arithmetic miss within this multiple of the tolerance is still
    /// retryable (the model may have misread a digit); beyond it the
    /// record is treated as a data-quality failure needing manual review.
    pub recoverable_miss_factor: f64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            concurrency: 4,
            cache_capacity: 256,
            cache_ttl_secs: 3600,
            inference_timeout_secs: 120,
            backoff_base_ms: 500,
            backoff_cap_ms: 15_000,
            rel_tolerance: 0.005,
            abs_tolerance: 0.01,
            recoverable_miss_factor: 8.0,
        }
    }
}

impl CoreConfig {
    /// Fail fast on nonsensical values. Called by every pipeline entry point.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.max_attempts) {
            return Err(ConfigError::OutOfRange {
                field: "max_attempts",
                value: self.max_attempts.to_string(),
                allowed: "1..=10",
            });
        }
        if !(1..=64).contains(&self.concurrency) {
            return Err(ConfigError::OutOfRange {
                field: "concurrency",
                value: self.concurrency.to_string(),
                allowed: "1..=64",
            });
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                field: "cache_capacity",
                value: "0".into(),
                allowed: ">= 1",
            });
        }
        if self.inference_timeout_secs == 0 {
            return Err(ConfigError::OutOfRange {
                field: "inference_timeout_secs",
                value: "0".into(),
                allowed: ">= 1",
            });
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::OutOfRange {
                field: "backoff_cap_ms",
                value: format!("{}/{}", self.backoff_base_ms, self.backoff_cap_ms),
                allowed: "base >= 1 and cap >= base",
            });
        }
        if !(0.0..1.0).contains(&self.rel_tolerance) {
            return Err(ConfigError::OutOfRange {
                field: "rel_tolerance",
                value: self.rel_tolerance.to_string(),
                allowed: "0.0..1.0",
            });
        }
        if self.abs_tolerance < 0.0 || !self.abs_tolerance.is_finite() {
            return Err(ConfigError::OutOfRange {
                field: "abs_tolerance",
                value: self.abs_tolerance.to_string(),
                allowed: ">= 0.0",
            });
        }
        if self.recoverable_miss_factor < 1.0 || !self.recoverable_miss_factor.is_finite() {
            return Err(ConfigError::OutOfRange {
                field: "recoverable_miss_factor",
                value: self.recoverable_miss_factor.to_string(),
                allowed: ">= 1.0",
            });
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}
