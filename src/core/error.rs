//! Error types for the batch pool.
//!
//! Failures are local to one worker slot and never abort sibling slots or the
//! pool loop; every variant here is also surfaced as text on the slot's
//! assigned [`LogSink`](crate::core::sink::LogSink).

use thiserror::Error;

/// Errors produced by pool components.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A handoff received an unexpected or missing acknowledgment. Fatal to
    /// the one offending slot only; never retried.
    #[error("slot {slot}: protocol violation: {detail}")]
    ProtocolViolation {
        /// Index of the offending worker slot.
        slot: usize,
        /// What was received instead of the expected acknowledgment.
        detail: String,
    },
    /// The worker went away without completing either handoff; the job is
    /// reported lost and its done-callback is never invoked.
    #[error("slot {slot}: worker exited without completing a handoff")]
    ProcessDeath {
        /// Index of the worker slot whose worker died.
        slot: usize,
    },
    /// The compute routine itself failed.
    #[error("compute failed: {0}")]
    Compute(String),
    /// Snapshot or dataset export failed. Logged only; a persistence failure
    /// never blocks the done-callback from firing with the in-memory result.
    #[error("snapshot write failed: {0}")]
    Snapshot(#[from] std::io::Error),
    /// A worker (thread or child process) could not be started.
    #[error("worker spawn failed: {0}")]
    Spawn(String),
    /// A channel endpoint disconnected mid-protocol.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PoolError::ProtocolViolation {
            slot: 3,
            detail: "bad token".into(),
        };
        assert_eq!(format!("{err}"), "slot 3: protocol violation: bad token");

        let err = PoolError::ProcessDeath { slot: 1 };
        assert_eq!(
            format!("{err}"),
            "slot 1: worker exited without completing a handoff"
        );

        let err = PoolError::InvalidConfig("concurrency must be at least 1".into());
        assert_eq!(
            format!("{err}"),
            "invalid configuration: concurrency must be at least 1"
        );
    }
}
