//! Builder assembling a pool from configuration and host collaborators.

use std::sync::Arc;

use crate::config::PoolConfig;
use crate::core::error::PoolError;
use crate::core::handle::DoneCallback;
use crate::core::persist::ResultExporter;
use crate::core::pool::PoolManager;
use crate::core::sink::{LogSink, SinkRotation};
use crate::core::spawn::WorkerSpawner;

/// Step-by-step construction of a [`PoolManager`].
///
/// The spawner and at least one rotation sink are required; everything else
/// is optional.
pub struct PoolBuilder {
    config: PoolConfig,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    sinks: Vec<Arc<dyn LogSink>>,
    main_sink: Option<Arc<dyn LogSink>>,
    done: Option<DoneCallback>,
    exporter: Option<Arc<dyn ResultExporter>>,
}

impl PoolBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            spawner: None,
            sinks: Vec::new(),
            main_sink: None,
            done: None,
            exporter: None,
        }
    }

    /// The worker transport.
    #[must_use]
    pub fn spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Add one sink to the rotation.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Replace the rotation's sinks.
    #[must_use]
    pub fn sinks(mut self, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        self.sinks = sinks;
        self
    }

    /// Sink for pool-level batch notices.
    #[must_use]
    pub fn main_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.main_sink = Some(sink);
        self
    }

    /// Callback fired with each completed result.
    #[must_use]
    pub fn done_callback(mut self, done: DoneCallback) -> Self {
        self.done = Some(done);
        self
    }

    /// Structured-dataset exporter collaborator.
    #[must_use]
    pub fn exporter(mut self, exporter: Arc<dyn ResultExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Validate and assemble the manager.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration is invalid,
    /// no spawner was supplied, or the rotation would be empty.
    pub fn build(self) -> Result<PoolManager, PoolError> {
        let spawner = self
            .spawner
            .ok_or_else(|| PoolError::InvalidConfig("a worker spawner is required".into()))?;
        let rotation = SinkRotation::new(self.sinks)?;
        let mut manager = PoolManager::new(self.config, spawner, rotation)?;
        if let Some(sink) = self.main_sink {
            manager = manager.with_main_sink(sink);
        }
        if let Some(done) = self.done {
            manager = manager.with_done_callback(done);
        }
        if let Some(exporter) = self.exporter {
            manager = manager.with_exporter(exporter);
        }
        Ok(manager)
    }
}
