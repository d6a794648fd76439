//! # Simbatch
//!
//! Process-pool orchestration for long-running numeric simulation jobs.
//!
//! This library runs batches of non-preemptible compute jobs on isolated
//! workers, streams their textual output back to a supervisor, supports
//! cooperative cancellation of in-flight work, and hands completed results
//! back through a strict acknowledgment protocol.
//!
//! ## Core Problem Solved
//!
//! Long-running numeric code has no safe preemption point in the host's
//! threading model, so cancellation cannot be forced in-process. Each job
//! therefore runs behind an isolation boundary: a hang or crash in the
//! compute routine cannot corrupt the supervisor's state, and a worker that
//! ignores cancellation can simply be abandoned.
//!
//! ## Key Features
//!
//! - **Bounded dispatch**: strict FIFO job queue, at most `concurrency`
//!   slots active at any instant (default: cores − 1)
//! - **Streamed output**: each worker's diagnostic text is relayed verbatim
//!   to a log sink assigned round-robin from a fixed rotation
//! - **Cooperative cancellation**: aborting the pool voids queued jobs
//!   immediately and signals every running worker; running jobs stop at
//!   their own safe points
//! - **Acknowledged handoffs**: results and abort confirmations cross the
//!   boundary with per-handoff correlation ids and a well-known ack token
//! - **Best-effort persistence**: completed results are snapshotted and
//!   exported before the done-callback fires; persistence failures never
//!   block the callback
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use simbatch::builders::PoolBuilder;
//! use simbatch::config::PoolConfig;
//! use simbatch::core::{MemorySink, ThreadSpawner};
//!
//! let spawner = Arc::new(ThreadSpawner::new(Arc::new(my_registry)));
//! let manager = PoolBuilder::new(PoolConfig::new().with_concurrency(2))
//!     .spawner(spawner)
//!     .sink(MemorySink::shared())
//!     .done_callback(Arc::new(|result| println!("{result:?}")))
//!     .build()?;
//!
//! let runner = manager.start(jobs)?;
//! // ... runner.abort() from the UI, runner.stats() for progress ...
//! runner.join();
//! ```
//!
//! There is no retry, no persistent queue across restarts, and no
//! prioritization beyond submission order. The GUI event loop, configuration
//! parsing, plotting, and the numeric compute routine itself are external
//! collaborators; the compute seam is the [`core::Solver`] trait rebuilt on
//! the worker side by a [`core::JobRegistry`].

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct pool components from configuration.
pub mod builders;
/// Configuration models for the pool.
pub mod config;
/// Core pool orchestration.
pub mod core;
/// Shared utilities.
pub mod util;
