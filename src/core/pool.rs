//! Bounded dispatch of a job queue over worker slots.
//!
//! The [`PoolManager`] owns the FIFO queue and the set of active slots. Its
//! supervisory loop dispatches jobs up to the concurrency limit, reaps
//! finished handles, and propagates a pool-wide abort. The loop waits on a
//! condvar bounded by the configured scan interval, so slots that finish
//! asynchronously from their own handle threads are reaped promptly while the
//! bound keeps every wait finite.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::PoolConfig;
use crate::core::error::PoolError;
use crate::core::handle::{DoneCallback, SlotContext, WorkerHandle};
use crate::core::job::{JobId, JobSpec, JobState};
use crate::core::persist::ResultExporter;
use crate::core::sink::{LogSink, SinkRotation};
use crate::core::spawn::WorkerSpawner;

/// Per-job state registry, readable from any thread.
#[derive(Debug, Default)]
pub struct StatusBoard {
    states: Mutex<HashMap<JobId, JobState>>,
}

impl StatusBoard {
    /// Record `state` for `id`.
    pub fn set(&self, id: JobId, state: JobState) {
        self.states.lock().insert(id, state);
    }

    /// Current state of `id`, if the job is known to this pool.
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<JobState> {
        self.states.lock().get(&id).copied()
    }

    /// Number of jobs currently in `state`.
    #[must_use]
    pub fn count(&self, state: JobState) -> usize {
        self.states.lock().values().filter(|s| **s == state).count()
    }
}

/// Lock-free terminal-state counters.
#[derive(Debug, Default)]
pub struct PoolCounters {
    /// Jobs handed to the pool at start.
    pub submitted: AtomicU64,
    /// Jobs whose result was received and acknowledged.
    pub completed: AtomicU64,
    /// Jobs whose abort was acknowledged.
    pub aborted: AtomicU64,
    /// Jobs whose worker went away without a handoff.
    pub lost: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn record_terminal(&self, state: JobState) {
        match state {
            JobState::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            JobState::Aborted => self.aborted.fetch_add(1, Ordering::Relaxed),
            JobState::Lost => self.lost.fetch_add(1, Ordering::Relaxed),
            JobState::Queued | JobState::Running => 0,
        };
    }
}

/// Snapshot of pool progress for host UIs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Jobs handed to the pool at start.
    pub submitted: u64,
    /// Jobs currently running.
    pub running: usize,
    /// Jobs still queued (including jobs voided by an abort).
    pub queued: usize,
    /// Jobs completed.
    pub completed: u64,
    /// Jobs aborted.
    pub aborted: u64,
    /// Jobs lost.
    pub lost: u64,
}

/// State shared between the manager loop, the slot handles, and the caller.
pub struct PoolShared {
    /// Per-job states.
    pub board: StatusBoard,
    /// Terminal-state counters.
    pub counters: PoolCounters,
    abort_requested: AtomicBool,
    wake: Mutex<bool>,
    wake_cv: Condvar,
}

impl PoolShared {
    fn new() -> Self {
        Self {
            board: StatusBoard::default(),
            counters: PoolCounters::default(),
            abort_requested: AtomicBool::new(false),
            wake: Mutex::new(false),
            wake_cv: Condvar::new(),
        }
    }

    /// Wake the manager loop ahead of its scan bound.
    pub fn notify(&self) {
        let mut pending = self.wake.lock();
        *pending = true;
        self.wake_cv.notify_all();
    }

    /// Bounded wait for a wake notification.
    fn wait(&self, bound: Duration) {
        let mut pending = self.wake.lock();
        if !*pending {
            self.wake_cv.wait_for(&mut pending, bound);
        }
        *pending = false;
    }

    fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }
}

/// Owner of the job queue and the bounded set of active worker slots.
pub struct PoolManager {
    config: Arc<PoolConfig>,
    spawner: Arc<dyn WorkerSpawner>,
    rotation: SinkRotation,
    main_sink: Option<Arc<dyn LogSink>>,
    done: Option<DoneCallback>,
    exporter: Option<Arc<dyn ResultExporter>>,
}

impl PoolManager {
    /// Create a manager from a validated configuration, a worker transport,
    /// and a sink rotation.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration fails
    /// validation.
    pub fn new(
        config: PoolConfig,
        spawner: Arc<dyn WorkerSpawner>,
        rotation: SinkRotation,
    ) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        Ok(Self {
            config: Arc::new(config),
            spawner,
            rotation,
            main_sink: None,
            done: None,
            exporter: None,
        })
    }

    /// Sink for pool-level batch notices ("Adding worker; 2 active").
    #[must_use]
    pub fn with_main_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.main_sink = Some(sink);
        self
    }

    /// Callback fired with each completed result.
    #[must_use]
    pub fn with_done_callback(mut self, done: DoneCallback) -> Self {
        self.done = Some(done);
        self
    }

    /// Structured-dataset exporter collaborator.
    #[must_use]
    pub fn with_exporter(mut self, exporter: Arc<dyn ResultExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Effective concurrency limit: the configured value, or available cores
    /// minus one, floored at 1.
    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.config
            .concurrency
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .max(1)
    }

    /// Begin the supervisory loop over `jobs` on a dedicated thread.
    ///
    /// Jobs start in strict FIFO submission order; completion order is
    /// unordered. The returned [`PoolRunner`] is the caller's view of the
    /// running batch.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Spawn` if the supervisor thread could not start.
    pub fn start(self, jobs: Vec<JobSpec>) -> Result<PoolRunner, PoolError> {
        let shared = Arc::new(PoolShared::new());
        shared
            .counters
            .submitted
            .store(
                u64::try_from(jobs.len()).unwrap_or(u64::MAX),
                Ordering::Relaxed,
            );
        for job in &jobs {
            shared.board.set(job.id, JobState::Queued);
        }

        let limit = self.concurrency_limit();
        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("simbatch-pool".into())
            .spawn(move || self.run(jobs, limit, &loop_shared))
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        Ok(PoolRunner {
            shared,
            thread: Some(thread),
        })
    }

    fn note(&self, text: &str) {
        debug!("{}", text.trim_end());
        if let Some(sink) = &self.main_sink {
            sink.append(text);
        }
    }

    fn run(self, jobs: Vec<JobSpec>, limit: usize, shared: &Arc<PoolShared>) {
        let mut queue: VecDeque<JobSpec> = jobs.into();
        let mut active: Vec<WorkerHandle> = Vec::new();
        let mut next_slot: usize = 0;
        let mut abort_seen = false;

        info!(jobs = queue.len(), limit, "starting batch");
        self.note(&format!(
            "Want to run {} jobs in batch mode; {limit} cores available for computation\n",
            queue.len()
        ));

        loop {
            // A pool abort voids every queued job (they stay Queued forever)
            // and signals each active handle, without waiting.
            if shared.abort_requested() {
                if !abort_seen {
                    abort_seen = true;
                    if !queue.is_empty() {
                        self.note(&format!(
                            "Aborting: discarding {} queued jobs\n",
                            queue.len()
                        ));
                        queue.clear();
                    }
                }
                // Signalling is idempotent, so late-observed handles are
                // covered by re-signalling every scan.
                for handle in &active {
                    handle.abort();
                }
            }

            if queue.is_empty() && active.is_empty() {
                break;
            }

            while active.len() < limit && !queue.is_empty() && !shared.abort_requested() {
                let spec = match queue.pop_front() {
                    Some(spec) => spec,
                    None => break,
                };
                let slot = next_slot;
                next_slot += 1;
                let sink = self.rotation.next();
                shared.board.set(spec.id, JobState::Running);
                let job_id = spec.id;
                let ctx = SlotContext {
                    slot,
                    spec,
                    sink,
                    config: Arc::clone(&self.config),
                    shared: Arc::clone(shared),
                    done: self.done.clone(),
                    exporter: self.exporter.clone(),
                };
                match WorkerHandle::spawn(ctx, Arc::clone(&self.spawner)) {
                    Ok(handle) => {
                        active.push(handle);
                        self.note(&format!("Adding worker; {} active\n", active.len()));
                    }
                    Err(err) => {
                        // Local failure: the job is lost, siblings continue.
                        error!(slot, error = %err, "could not start worker slot");
                        shared.board.set(job_id, JobState::Lost);
                        shared.counters.lost.fetch_add(1, Ordering::Relaxed);
                        self.note(&format!("{err}\n"));
                    }
                }
            }

            let before = active.len();
            for mut handle in std::mem::take(&mut active) {
                if handle.is_finished() {
                    handle.join();
                } else {
                    active.push(handle);
                }
            }
            if active.len() != before {
                self.note(&format!("Worker finished; now {} active\n", active.len()));
            }

            shared.wait(self.config.scan_interval());
        }

        info!("batch finished");
        self.note("Batch complete\n");
    }
}

/// Caller's view of a running batch: abort, progress, completion.
pub struct PoolRunner {
    shared: Arc<PoolShared>,
    thread: Option<JoinHandle<()>>,
}

impl PoolRunner {
    /// Abort the batch: queued jobs are voided immediately and every running
    /// worker is signalled, without waiting for them to finish. Idempotent;
    /// a second call has no additional observable effect. Confirmation
    /// prompts are the host's responsibility.
    pub fn abort(&self) {
        self.shared.abort_requested.store(true, Ordering::Release);
        self.shared.notify();
    }

    /// Current state of one job.
    #[must_use]
    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.shared.board.get(id)
    }

    /// Snapshot of batch progress.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.shared.counters.submitted.load(Ordering::Relaxed),
            running: self.shared.board.count(JobState::Running),
            queued: self.shared.board.count(JobState::Queued),
            completed: self.shared.counters.completed.load(Ordering::Relaxed),
            aborted: self.shared.counters.aborted.load(Ordering::Relaxed),
            lost: self.shared.counters.lost.load(Ordering::Relaxed),
        }
    }

    /// True once the supervisory loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Block until the batch has fully drained (all jobs terminal or voided).
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("pool thread panicked");
            }
        }
    }
}

impl Drop for PoolRunner {
    fn drop(&mut self) {
        // Dropping the runner without joining leaves the batch running to
        // completion; the loop owns no reference back to the runner.
        if self.thread.is_some() {
            debug!("pool runner dropped while batch still running");
        }
    }
}
