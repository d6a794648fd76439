//! Pool configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::persist::default_temp_dir;

const fn default_scan_ms() -> u64 {
    2_000
}

const fn default_liveness_ms() -> u64 {
    500
}

const fn default_ack_ms() -> u64 {
    100
}

const fn default_output_buffer() -> usize {
    1024
}

fn default_prefix() -> String {
    "simbatch run".to_string()
}

/// Pool configuration.
///
/// All waits in the pool are bounded by these intervals: the manager's queue
/// scan, each handle's liveness poll, and the acknowledgment wait granularity
/// during handoffs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrently active worker slots. `None` selects available
    /// cores minus one, floored at 1.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Bound on the manager loop's scan wait, in milliseconds.
    #[serde(default = "default_scan_ms")]
    pub scan_interval_ms: u64,
    /// Bound on each handle's liveness poll, in milliseconds.
    #[serde(default = "default_liveness_ms")]
    pub liveness_poll_ms: u64,
    /// Granularity of acknowledgment waits, in milliseconds.
    #[serde(default = "default_ack_ms")]
    pub ack_poll_ms: u64,
    /// Capacity of each worker's buffered output channel.
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    /// Directory for snapshots and datasets. `None` selects the per-user
    /// default (`<home>/.simbatch-temp`).
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Prefix of snapshot identifiers.
    #[serde(default = "default_prefix")]
    pub snapshot_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            scan_interval_ms: default_scan_ms(),
            liveness_poll_ms: default_liveness_ms(),
            ack_poll_ms: default_ack_ms(),
            output_buffer: default_output_buffer(),
            temp_dir: None,
            snapshot_prefix: default_prefix(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fixed concurrency limit.
    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    /// Set the scan-wait bound in milliseconds.
    #[must_use]
    pub fn with_scan_interval_ms(mut self, ms: u64) -> Self {
        self.scan_interval_ms = ms;
        self
    }

    /// Set the liveness-poll bound in milliseconds.
    #[must_use]
    pub fn with_liveness_poll_ms(mut self, ms: u64) -> Self {
        self.liveness_poll_ms = ms;
        self
    }

    /// Set the acknowledgment-wait granularity in milliseconds.
    #[must_use]
    pub fn with_ack_poll_ms(mut self, ms: u64) -> Self {
        self.ack_poll_ms = ms;
        self
    }

    /// Set the snapshot/dataset directory.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Set the snapshot identifier prefix.
    #[must_use]
    pub fn with_snapshot_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.snapshot_prefix = prefix.into();
        self
    }

    /// Bound on the manager loop's scan wait.
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Bound on each handle's liveness poll.
    #[must_use]
    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }

    /// Granularity of acknowledgment waits.
    #[must_use]
    pub fn ack_poll(&self) -> Duration {
        Duration::from_millis(self.ack_poll_ms)
    }

    /// Effective snapshot/dataset directory.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(default_temp_dir)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == Some(0) {
            return Err("concurrency must be at least 1".into());
        }
        if self.scan_interval_ms == 0 {
            return Err("scan_interval_ms must be greater than 0".into());
        }
        if self.liveness_poll_ms == 0 {
            return Err("liveness_poll_ms must be greater than 0".into());
        }
        if self.ack_poll_ms == 0 {
            return Err("ack_poll_ms must be greater than 0".into());
        }
        if self.output_buffer == 0 {
            return Err("output_buffer must be greater than 0".into());
        }
        if self.snapshot_prefix.is_empty() {
            return Err("snapshot_prefix must not be empty".into());
        }
        Ok(())
    }

    /// Parse a configuration from a JSON string and validate it.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation error description.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = PoolConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scan_interval(), Duration::from_secs(2));
        assert_eq!(cfg.liveness_poll(), Duration::from_millis(500));
        assert_eq!(cfg.ack_poll(), Duration::from_millis(100));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(PoolConfig::new().with_concurrency(0).validate().is_err());
        assert!(PoolConfig::new().with_scan_interval_ms(0).validate().is_err());
        assert!(PoolConfig::new().with_ack_poll_ms(0).validate().is_err());
        assert!(PoolConfig::new().with_snapshot_prefix("").validate().is_err());
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let cfg = PoolConfig::from_json_str(r#"{"concurrency": 3}"#).unwrap();
        assert_eq!(cfg.concurrency, Some(3));
        assert_eq!(cfg.scan_interval_ms, 2_000);
        assert_eq!(cfg.snapshot_prefix, "simbatch run");
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(PoolConfig::from_json_str(r#"{"concurrency": 0}"#).is_err());
        assert!(PoolConfig::from_json_str("not json").is_err());
    }
}
