//! Shared utilities.

pub mod clock;
pub mod telemetry;

pub use clock::snapshot_timestamp;
pub use telemetry::init_tracing;
