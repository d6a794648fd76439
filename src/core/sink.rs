//! Log sinks and the round-robin sink rotation.
//!
//! Workers stream diagnostic text to whichever sink the rotation assigned
//! them. The rotation is a fixed cyclic pool: the sink popped for a new
//! worker goes straight back to the end, so with fewer sinks than concurrent
//! workers a sink is shared and its output interleaves (order unspecified,
//! nothing lost).

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::PoolError;

/// An append-only text target for worker output.
pub trait LogSink: Send + Sync {
    /// Append text verbatim. Implementations must tolerate interleaved
    /// appends from several worker slots.
    fn append(&self, text: &str);
}

/// In-memory sink backed by a shared string buffer. Hosts poll
/// [`MemorySink::contents`] to move text into their own widgets.
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Mutex<String>,
}

impl MemorySink {
    /// Create an empty shared sink.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything appended so far.
    #[must_use]
    pub fn contents(&self) -> String {
        self.buf.lock().clone()
    }
}

impl LogSink for MemorySink {
    fn append(&self, text: &str) {
        self.buf.lock().push_str(text);
    }
}

/// Sink that appends to any writer (a file, stderr, a pipe).
pub struct WriterSink<W: Write + Send> {
    inner: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> LogSink for WriterSink<W> {
    fn append(&self, text: &str) {
        let mut w = self.inner.lock();
        // A sink that cannot accept text has nowhere better to report it.
        let _ = w.write_all(text.as_bytes());
        let _ = w.flush();
    }
}

/// Sink that forwards each append as a `tracing` info event.
#[derive(Debug, Clone)]
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    /// Create a sink that tags events with `label`.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl LogSink for TracingSink {
    fn append(&self, text: &str) {
        tracing::info!(sink = %self.label, "{}", text.trim_end());
    }
}

/// Fixed cyclic pool of sinks handed out round-robin.
pub struct SinkRotation {
    sinks: Mutex<VecDeque<Arc<dyn LogSink>>>,
}

impl SinkRotation {
    /// Build a rotation over a fixed set of sinks.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if `sinks` is empty.
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Result<Self, PoolError> {
        if sinks.is_empty() {
            return Err(PoolError::InvalidConfig(
                "sink rotation requires at least one sink".into(),
            ));
        }
        Ok(Self {
            sinks: Mutex::new(sinks.into()),
        })
    }

    /// Pop the next sink and immediately push it back to the end of the
    /// rotation. The same sink may therefore serve several workers at once.
    #[must_use]
    pub fn next(&self) -> Arc<dyn LogSink> {
        let mut sinks = self.sinks.lock();
        let sink = sinks
            .pop_front()
            .unwrap_or_else(|| unreachable!("rotation is never empty"));
        sinks.push_back(Arc::clone(&sink));
        sink
    }

    /// Number of sinks in the rotation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    /// True if the rotation holds no sinks. Never true for a constructed
    /// rotation; present for API completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.lock().is_empty()
    }
}
