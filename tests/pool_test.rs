//! Integration tests for the batch pool.
//!
//! These tests validate the observable properties of the orchestration core:
//! - Concurrency never exceeds the configured limit
//! - Every job reaches exactly one terminal state
//! - Cooperative cancellation (pool abort) and its idempotence
//! - Lost-job detection when a worker dies without a handoff
//! - Verbatim output relay through a shared sink rotation
//! - Result round-trip fidelity into the done-callback
//! - Snapshot persistence alongside the exporter collaborator

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use simbatch::builders::PoolBuilder;
use simbatch::config::PoolConfig;
use simbatch::core::{
    AppResult, JobRegistry, JobSpec, JobState, JsonExporter, MemorySink, PoolRunner,
    ResultEnvelope, RunContext, Solver, SolverMethod, SolverRun, ThreadSpawner,
};
use simbatch::util::init_tracing;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn fast_config(dir: &std::path::Path) -> PoolConfig {
    PoolConfig::new()
        .with_scan_interval_ms(20)
        .with_liveness_poll_ms(10)
        .with_ack_poll_ms(10)
        .with_temp_dir(dir)
        .with_snapshot_prefix("test run")
}

fn job(id: u64, label: &str) -> JobSpec {
    JobSpec {
        id,
        label: label.to_string(),
        solver: SolverMethod::Euler { steps: 100 },
        params: BTreeMap::new(),
        one_cycle: false,
        plot_every_cycle: false,
    }
}

fn job_with(id: u64, label: &str, params: &[(&str, f64)]) -> JobSpec {
    let mut spec = job(id, label);
    spec.params = params
        .iter()
        .map(|(k, v)| ((*k).to_string(), *v))
        .collect();
    spec
}

/// Poll `cond` until it holds or `timeout` expires.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn drain(runner: &mut PoolRunner) {
    assert!(
        wait_until(Duration::from_secs(10), || runner.is_finished()),
        "pool did not drain in time"
    );
    runner.join();
}

// ============================================================================
// TEST REGISTRY - a solver with scriptable behavior per job
// ============================================================================

/// Solver behavior is scripted through job params:
/// - `work_ms`: run for roughly this long (default 20)
/// - `hold`: ignore `work_ms` and run until cancelled (safety cap 5 s)
/// - `fail`: return a compute error without any handoff
#[derive(Default)]
struct TestRegistry {
    concurrent: Arc<AtomicU64>,
    max_concurrent: Arc<AtomicU64>,
}

struct TestSolver {
    concurrent: Arc<AtomicU64>,
    max_concurrent: Arc<AtomicU64>,
}

impl JobRegistry for TestRegistry {
    fn solver(&self, _spec: &JobSpec) -> AppResult<Box<dyn Solver>> {
        Ok(Box::new(TestSolver {
            concurrent: Arc::clone(&self.concurrent),
            max_concurrent: Arc::clone(&self.max_concurrent),
        }))
    }
}

impl Solver for TestSolver {
    fn run(&mut self, spec: &JobSpec, ctx: &mut RunContext<'_>) -> AppResult<SolverRun> {
        if spec.params.contains_key("fail") {
            ctx.say(&format!("{}: entering compute", spec.label));
            anyhow::bail!("synthetic compute failure");
        }

        let running = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);
        ctx.say(&format!("{}: starting", spec.label));

        let hold = spec.params.contains_key("hold");
        let work_ms = spec.params.get("work_ms").copied().unwrap_or(20.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let deadline = Instant::now() + Duration::from_millis(work_ms as u64);
        let safety = Instant::now() + Duration::from_secs(5);

        let mut cycles = 0u32;
        loop {
            if ctx.cancelled() {
                ctx.say(&format!("{}: cancelled at cycle {cycles}", spec.label));
                break;
            }
            ctx.hooks().on_cycle_end(cycles);
            cycles += 1;
            let now = Instant::now();
            if (hold && now >= safety) || (!hold && now >= deadline) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        ctx.say(&format!("{}: finished after {cycles} cycles", spec.label));
        Ok(SolverRun {
            cycles_run: cycles,
            metrics: BTreeMap::from([
                ("eta_v".to_string(), 0.91),
                ("cycles".to_string(), f64::from(cycles)),
            ]),
        })
    }
}

struct Harness {
    registry: Arc<TestRegistry>,
    done: Arc<Mutex<Vec<ResultEnvelope>>>,
    sink: Arc<MemorySink>,
    main_sink: Arc<MemorySink>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn start(concurrency: usize, jobs: Vec<JobSpec>) -> (Self, PoolRunner) {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TestRegistry::default());
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = MemorySink::shared();
        let main_sink = MemorySink::shared();

        let done_cb = Arc::clone(&done);
        let manager = PoolBuilder::new(fast_config(dir.path()).with_concurrency(concurrency))
            .spawner(Arc::new(ThreadSpawner::new(Arc::clone(&registry))))
            .sink(sink.clone())
            .main_sink(main_sink.clone())
            .done_callback(Arc::new(move |env| done_cb.lock().push(env)))
            .exporter(Arc::new(JsonExporter))
            .build()
            .unwrap();

        let runner = manager.start(jobs).unwrap();
        (
            Self {
                registry,
                done,
                sink,
                main_sink,
                dir,
            },
            runner,
        )
    }
}

// ============================================================================
// SCENARIO A - bounded concurrency, full completion
// ============================================================================

#[test]
fn test_five_jobs_limit_two_all_complete() {
    let jobs = (1..=5).map(|i| job(i, &format!("job-{i}"))).collect();
    let (harness, mut runner) = Harness::start(2, jobs);
    drain(&mut runner);

    assert!(harness.registry.max_concurrent.load(Ordering::SeqCst) <= 2);

    for id in 1..=5 {
        assert_eq!(runner.state(id), Some(JobState::Completed), "job {id}");
    }
    let stats = runner.stats();
    assert_eq!(stats.submitted, 5);
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.aborted, 0);
    assert_eq!(stats.lost, 0);
    assert_eq!(stats.running, 0);
    assert_eq!(harness.done.lock().len(), 5);

    let notices = harness.main_sink.contents();
    assert!(notices.contains("Want to run 5 jobs in batch mode"));
    assert!(notices.contains("Batch complete"));
}

// ============================================================================
// SCENARIO B - pool abort voids queued jobs, cancels the running one
// ============================================================================

#[test]
fn test_abort_cancels_running_and_voids_queued() {
    let jobs = vec![
        job_with(1, "held", &[("hold", 1.0)]),
        job(2, "queued-2"),
        job(3, "queued-3"),
    ];
    let (harness, mut runner) = Harness::start(1, jobs);

    assert!(
        wait_until(Duration::from_secs(5), || runner.state(1)
            == Some(JobState::Running)),
        "job 1 never started"
    );

    runner.abort();
    // Idempotence: a second abort has no additional observable effect.
    runner.abort();
    drain(&mut runner);

    assert_eq!(runner.state(1), Some(JobState::Aborted));
    assert_eq!(runner.state(2), Some(JobState::Queued));
    assert_eq!(runner.state(3), Some(JobState::Queued));

    let stats = runner.stats();
    assert_eq!(stats.aborted, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.queued, 2);
    assert!(harness.done.lock().is_empty());

    let log = harness.sink.contents();
    assert!(log.contains("held: worker has aborted successfully"));
}

// ============================================================================
// SCENARIO C - worker dies without a handoff, job is lost
// ============================================================================

#[test]
fn test_failed_compute_reports_lost_without_callback() {
    let jobs = vec![job_with(1, "doomed", &[("fail", 1.0)])];
    let (harness, mut runner) = Harness::start(1, jobs);
    drain(&mut runner);

    assert_eq!(runner.state(1), Some(JobState::Lost));
    assert_eq!(runner.stats().lost, 1);
    assert!(harness.done.lock().is_empty());

    let log = harness.sink.contents();
    assert!(log.contains("doomed: compute failed"));
    assert!(log.contains("job lost"));
}

// ============================================================================
// SCENARIO D - one sink shared by two concurrent workers
// ============================================================================

#[test]
fn test_shared_sink_interleaves_without_loss() {
    let jobs = vec![
        job_with(1, "left", &[("work_ms", 40.0)]),
        job_with(2, "right", &[("work_ms", 40.0)]),
    ];
    let (harness, mut runner) = Harness::start(2, jobs);
    drain(&mut runner);

    let log = harness.sink.contents();
    for needle in [
        "left: starting",
        "right: starting",
        "left: finished",
        "right: finished",
    ] {
        assert!(log.contains(needle), "missing {needle:?} in {log}");
    }
}

// ============================================================================
// RESULT ROUND-TRIP AND PERSISTENCE
// ============================================================================

#[test]
fn test_result_round_trip_and_snapshot() {
    let jobs = vec![job(7, "precise")];
    let (harness, mut runner) = Harness::start(1, jobs);
    drain(&mut runner);

    let done = harness.done.lock();
    assert_eq!(done.len(), 1);
    let env = &done[0];
    assert_eq!(env.job_id, 7);
    assert_eq!(env.label, "precise");
    assert_eq!(env.solver, SolverMethod::Euler { steps: 100 });
    assert!((env.metrics["eta_v"] - 0.91).abs() < f64::EPSILON);
    assert!(env.cycles_run > 0);

    // The snapshot on disk is the same envelope, field for field.
    let snapshot = std::fs::read_dir(harness.dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "snapshot"))
        .expect("no snapshot written");
    let from_disk: ResultEnvelope =
        serde_json::from_slice(&std::fs::read(&snapshot).unwrap()).unwrap();
    assert_eq!(&from_disk, env);

    // The exporter collaborator wrote its dataset next to it.
    assert!(snapshot.with_extension("json").exists());

    let log = harness.sink.contents();
    assert!(log.contains("Wrote snapshot to"));
    assert!(log.contains("precise: worker is done"));
}

// ============================================================================
// MIXED BATCH - each job reaches exactly one terminal state
// ============================================================================

#[test]
fn test_mixed_batch_terminal_states() {
    let jobs = vec![
        job(1, "ok-1"),
        job_with(2, "bad", &[("fail", 1.0)]),
        job(3, "ok-2"),
    ];
    let (harness, mut runner) = Harness::start(2, jobs);
    drain(&mut runner);

    assert_eq!(runner.state(1), Some(JobState::Completed));
    assert_eq!(runner.state(2), Some(JobState::Lost));
    assert_eq!(runner.state(3), Some(JobState::Completed));

    let stats = runner.stats();
    assert_eq!(stats.completed + stats.aborted + stats.lost, 3);
    assert_eq!(harness.done.lock().len(), 2);
}
