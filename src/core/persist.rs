//! Best-effort persistence of completed results.
//!
//! After a result handoff the handle writes a binary snapshot of the envelope
//! to the temp directory and asks the exporter collaborator for a structured
//! dataset file. Both writes are independently failure-tolerant: a failure
//! here is logged and never blocks the done-callback.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::core::error::{AppResult, PoolError};
use crate::core::job::ResultEnvelope;
use crate::core::sink::LogSink;
use crate::util::clock;

/// Writes a structured dataset for a completed result. Supplied by the host;
/// failures are logged only.
pub trait ResultExporter: Send + Sync {
    /// Write `result` as a structured dataset at `path`.
    ///
    /// # Errors
    ///
    /// Any error is reported on the job's log sink and otherwise ignored.
    fn write(&self, result: &ResultEnvelope, path: &Path) -> AppResult<()>;
}

/// Exporter that writes the envelope as pretty-printed JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonExporter;

impl ResultExporter for JsonExporter {
    fn write(&self, result: &ResultEnvelope, path: &Path) -> AppResult<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, result)?;
        Ok(())
    }
}

/// Default per-user temp directory: `<home>/.simbatch-temp`, falling back to
/// the system temp directory when no home is known.
#[must_use]
pub fn default_temp_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map_or_else(std::env::temp_dir, PathBuf::from)
        .join(".simbatch-temp")
}

/// Build the unique run identifier: `<prefix> <timestamp>_t<slot>`.
#[must_use]
pub fn run_identifier(prefix: &str, slot: usize) -> String {
    format!("{prefix} {}_t{slot}", clock::snapshot_timestamp())
}

/// Resolve the snapshot path for `identifier`, appending a suffix letter
/// (A, B, C, ...) if the target already exists.
#[must_use]
pub fn snapshot_path(dir: &Path, identifier: &str) -> PathBuf {
    let base = dir.join(format!("{identifier}.snapshot"));
    if !base.exists() {
        return base;
    }
    let mut code = u32::from('A');
    loop {
        let suffix = char::from_u32(code).unwrap_or('Z');
        let candidate = dir.join(format!("{identifier}{suffix}.snapshot"));
        if !candidate.exists() {
            return candidate;
        }
        code += 1;
    }
}

fn write_snapshot(path: &Path, envelope: &ResultEnvelope) -> Result<(), PoolError> {
    let bytes = serde_json::to_vec(envelope)
        .map_err(|e| PoolError::Snapshot(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    fs::write(path, bytes)?;
    Ok(())
}

/// Persist a completed result: snapshot plus exporter dataset, both
/// best-effort. Progress and failures are reported on `sink`.
pub fn persist(
    envelope: &ResultEnvelope,
    temp_dir: &Path,
    prefix: &str,
    slot: usize,
    sink: &dyn LogSink,
    exporter: Option<&Arc<dyn ResultExporter>>,
) {
    // Idempotent create.
    if let Err(err) = fs::create_dir_all(temp_dir) {
        warn!(dir = %temp_dir.display(), error = %err, "could not create temp directory");
        sink.append(&format!(
            "could not create temp directory {}: {err}\n",
            temp_dir.display()
        ));
        return;
    }

    let identifier = run_identifier(prefix, slot);
    let path = snapshot_path(temp_dir, &identifier);
    match write_snapshot(&path, envelope) {
        Ok(()) => sink.append(&format!("Wrote snapshot to {}\n", path.display())),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "snapshot write failed");
            sink.append(&format!("{err}\n"));
        }
    }

    if let Some(exporter) = exporter {
        let dataset = path.with_extension("json");
        match exporter.write(envelope, &dataset) {
            Ok(()) => sink.append(&format!("Wrote dataset to {}\n", dataset.display())),
            Err(err) => {
                warn!(path = %dataset.display(), error = %err, "dataset export failed");
                sink.append(&format!("dataset export failed: {err:#}\n"));
            }
        }
    }
}
