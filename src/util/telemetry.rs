//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Install the default `tracing` subscriber if none is set yet.
///
/// Filtering follows `RUST_LOG`, defaulting to `simbatch=info`. Diagnostics
/// go to stderr: a worker process's stdout is reserved for protocol frames,
/// so nothing here may ever print there. Hosts that install their own
/// subscriber first are left alone.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("simbatch=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
