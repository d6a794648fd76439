//! Job payloads, results, and the compute-routine seam.
//!
//! A [`JobSpec`] is the strict transferable shape that crosses the isolation
//! boundary: plain serializable data, no callables, no open handles. The live
//! pieces a run needs (solver, progress hooks, cancellation probe, output
//! sink) are rebuilt on the worker side of the boundary by a [`JobRegistry`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::error::AppResult;
use crate::core::worker::{CancelProbe, ChannelSink};

/// Stable caller-assigned job identifier. Must be unique within one batch.
pub type JobId = u64;

/// Cycle-integrator selection for the compute routine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SolverMethod {
    /// Fixed-step Euler integration.
    Euler {
        /// Number of steps per cycle.
        steps: u32,
    },
    /// Fixed-step Heun (predictor-corrector) integration.
    Heun {
        /// Number of steps per cycle.
        steps: u32,
    },
    /// Adaptive Runge-Kutta 4/5 integration.
    Rk45 {
        /// Per-step error tolerance.
        tolerance: f64,
    },
}

/// Transferable payload describing one simulation job.
///
/// Created by the caller, never mutated by the pool, consumed by exactly one
/// worker. Everything reachable from it is plain data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Caller-assigned identifier, unique within the batch.
    pub id: JobId,
    /// Human-readable label used as a prefix on log lines.
    pub label: String,
    /// Solver-method selector.
    pub solver: SolverMethod,
    /// Named numeric parameters for the compute routine.
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    /// Run a single cycle and stop.
    #[serde(default)]
    pub one_cycle: bool,
    /// Emit plot data after every cycle rather than at the end.
    #[serde(default)]
    pub plot_every_cycle: bool,
}

/// Job output as produced by the worker side of the boundary.
///
/// Transferability is enforced by construction: the envelope only holds plain
/// data, so nothing has to be stripped at handoff time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Identifier of the job that produced this result.
    pub job_id: JobId,
    /// Label of the job that produced this result.
    pub label: String,
    /// Solver method the run used.
    pub solver: SolverMethod,
    /// Number of cycles the solver completed.
    pub cycles_run: u32,
    /// Wall-clock duration of the compute call in milliseconds.
    pub elapsed_ms: u64,
    /// Flat map of named output metrics.
    pub metrics: BTreeMap<String, f64>,
}

/// Lifecycle state of one job.
///
/// Exactly one terminal state is reached per job; `Running` is the only state
/// in which cancellation can take effect. Jobs voided by a pool abort stay
/// `Queued` permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the FIFO queue.
    Queued,
    /// Dispatched to a worker slot.
    Running,
    /// Result received and acknowledged.
    Completed,
    /// Cancellation acknowledged by the worker.
    Aborted,
    /// Worker went away without a handoff.
    Lost,
}

/// Progress callbacks owned by the compute routine, not by this crate.
///
/// All hooks default to no-ops; hosts override the ones they care about
/// (typically to feed live plots).
pub trait ProgressHooks: Send {
    /// A full cycle finished.
    fn on_cycle_end(&mut self, _cycle: u32) {}
    /// The heat-transfer pass of a cycle finished.
    fn on_heat_transfer(&mut self, _cycle: u32) {}
    /// The lump energy balance of a cycle finished.
    fn on_lump_energy_balance(&mut self, _cycle: u32) {}
    /// One integration step finished.
    fn on_step(&mut self, _cycle: u32, _step: u64) {}
}

/// Hook implementation that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ProgressHooks for NoHooks {}

/// Everything a compute call may touch while it runs.
///
/// The output sink is threaded through explicitly rather than substituting
/// process-wide stdout; the cancellation probe is the solver's cooperative
/// cancellation point.
pub struct RunContext<'a> {
    sink: &'a ChannelSink,
    probe: &'a CancelProbe,
    hooks: &'a mut dyn ProgressHooks,
}

impl<'a> RunContext<'a> {
    /// Assemble a context from the worker-side pieces.
    pub fn new(
        sink: &'a ChannelSink,
        probe: &'a CancelProbe,
        hooks: &'a mut dyn ProgressHooks,
    ) -> Self {
        Self { sink, probe, hooks }
    }

    /// The output sink for diagnostic text. Every write is relayed verbatim
    /// to the supervisor's assigned log sink.
    #[must_use]
    pub fn out(&self) -> &ChannelSink {
        self.sink
    }

    /// Write one line of diagnostic text.
    pub fn say(&self, text: &str) {
        self.sink.line(text);
    }

    /// True once the supervisor has requested cancellation (or has gone
    /// away). Solvers poll this at their own safe points; how quickly a run
    /// stops is entirely up to the solver's polling granularity.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.probe.poll()
    }

    /// The job's progress hooks.
    pub fn hooks(&mut self) -> &mut dyn ProgressHooks {
        self.hooks
    }
}

/// Output of one compute call, before the worker wraps it in an envelope.
#[derive(Debug, Clone, Default)]
pub struct SolverRun {
    /// Number of cycles completed (possibly short of the target if the run
    /// was cancelled).
    pub cycles_run: u32,
    /// Named output metrics.
    pub metrics: BTreeMap<String, f64>,
}

/// The compute entry point. Implemented by the host; this crate never
/// understands the physics behind it.
pub trait Solver: Send {
    /// Run the simulation described by `spec`.
    ///
    /// Implementations should poll [`RunContext::cancelled`] at safe points
    /// and return early (with whatever partial state they have) when it turns
    /// true. Errors are surfaced as text on the job's log sink; the job then
    /// never reaches `Completed`.
    fn run(&mut self, spec: &JobSpec, ctx: &mut RunContext<'_>) -> AppResult<SolverRun>;
}

/// Builder that reconstructs the live, non-transferable pieces of a job on
/// the worker side of the isolation boundary.
pub trait JobRegistry: Send + Sync + 'static {
    /// Build the solver selected by the spec.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec selects a method or parameters this host
    /// cannot build a solver for.
    fn solver(&self, spec: &JobSpec) -> AppResult<Box<dyn Solver>>;

    /// Build the job's progress hooks. Defaults to no-ops.
    fn hooks(&self, _spec: &JobSpec) -> Box<dyn ProgressHooks> {
        Box::new(NoHooks)
    }
}
