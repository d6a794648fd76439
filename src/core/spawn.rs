//! The isolation boundary: worker spawning and channel transports.
//!
//! The supervisor never talks to a worker directly; it talks to a
//! [`WorkerLink`] handed out by a [`WorkerSpawner`]. Two transports exist:
//!
//! - [`ThreadSpawner`] runs the job on a dedicated OS thread over crossbeam
//!   channels. Used by tests and by hosts that accept in-process execution.
//! - [`ProcessSpawner`] runs the job in a real child process (typically the
//!   host binary re-invoked in worker mode via [`worker_main`]), multiplexing
//!   the three logical channels over the child's stdin/stdout as tagged JSON
//!   lines and bridging them back to crossbeam channels with pump threads.
//!
//! Above this seam the handoff protocol is transport-blind.

use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context as _;
use crossbeam_channel::{bounded, never, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::core::error::{AppResult, PoolError};
use crate::core::job::{JobRegistry, JobSpec};
use crate::core::protocol::{ProtocolMsg, WireMsg};
use crate::core::worker::run_job;

/// Default capacity of the buffered output channel.
pub const DEFAULT_OUTPUT_BUFFER: usize = 1024;

/// One direction-pair of a bidirectional channel.
#[derive(Debug, Clone)]
pub struct Duplex<S, R> {
    /// Sending half.
    pub tx: Sender<S>,
    /// Receiving half.
    pub rx: Receiver<R>,
}

/// Create a bidirectional channel, returning the two matching endpoints.
#[must_use]
pub fn duplex<A: Send, B: Send>() -> (Duplex<A, B>, Duplex<B, A>) {
    let (a_tx, a_rx) = unbounded::<A>();
    let (b_tx, b_rx) = unbounded::<B>();
    (
        Duplex { tx: a_tx, rx: b_rx },
        Duplex { tx: b_tx, rx: a_rx },
    )
}

/// Worker-side endpoints for one job: buffered output (worker to supervisor),
/// duplex abort, duplex result.
#[derive(Debug, Clone)]
pub struct WorkerEndpoints {
    /// Output channel sender; every write is relayed to the assigned sink.
    pub output: Sender<String>,
    /// Abort channel: receives abort requests, sends the abort ack.
    pub abort: Duplex<ProtocolMsg, ProtocolMsg>,
    /// Result channel: sends the result, receives the result ack.
    pub result: Duplex<ProtocolMsg, ProtocolMsg>,
}

/// Supervisor-side endpoints mirroring [`WorkerEndpoints`].
#[derive(Debug, Clone)]
pub struct HandleEndpoints {
    /// Output channel receiver, drained verbatim into the assigned sink.
    pub output: Receiver<String>,
    /// Abort channel: sends abort requests, receives the abort ack.
    pub abort: Duplex<ProtocolMsg, ProtocolMsg>,
    /// Result channel: receives the result, sends the result ack.
    pub result: Duplex<ProtocolMsg, ProtocolMsg>,
}

/// Create the three channels for one job.
#[must_use]
pub fn job_channels(output_buffer: usize) -> (HandleEndpoints, WorkerEndpoints) {
    let (out_tx, out_rx) = bounded(output_buffer);
    let (handle_abort, worker_abort) = duplex();
    let (handle_result, worker_result) = duplex();
    (
        HandleEndpoints {
            output: out_rx,
            abort: handle_abort,
            result: handle_result,
        },
        WorkerEndpoints {
            output: out_tx,
            abort: worker_abort,
            result: worker_result,
        },
    )
}

/// A live worker as seen from its supervising handle.
pub trait WorkerLink: Send {
    /// The supervisor-side channel endpoints.
    fn endpoints(&self) -> &HandleEndpoints;
    /// True while the worker (thread or process) is still running.
    fn is_alive(&mut self) -> bool;
    /// Wait for the worker to finish and release its resources.
    fn join(&mut self);
}

/// Spawns one worker per dispatched job.
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Start a worker for `spec` in slot `slot`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Spawn` if the worker could not be started.
    fn spawn(&self, slot: usize, spec: JobSpec) -> Result<Box<dyn WorkerLink>, PoolError>;
}

/// First line a child process receives on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    /// Slot index assigned by the pool.
    pub slot: usize,
    /// The job to run.
    pub spec: JobSpec,
}

// ---------------------------------------------------------------------------
// Thread transport
// ---------------------------------------------------------------------------

/// Runs each job on a dedicated OS thread.
pub struct ThreadSpawner<R: JobRegistry> {
    registry: Arc<R>,
    output_buffer: usize,
}

impl<R: JobRegistry> ThreadSpawner<R> {
    /// Create a spawner that rebuilds jobs through `registry`.
    #[must_use]
    pub fn new(registry: Arc<R>) -> Self {
        Self {
            registry,
            output_buffer: DEFAULT_OUTPUT_BUFFER,
        }
    }

    /// Override the output channel capacity.
    #[must_use]
    pub fn with_output_buffer(mut self, capacity: usize) -> Self {
        self.output_buffer = capacity;
        self
    }
}

impl<R: JobRegistry> WorkerSpawner for ThreadSpawner<R> {
    fn spawn(&self, slot: usize, spec: JobSpec) -> Result<Box<dyn WorkerLink>, PoolError> {
        let (handle_end, worker_end) = job_channels(self.output_buffer);
        let registry = Arc::clone(&self.registry);
        let thread = thread::Builder::new()
            .name(format!("simbatch-worker-{slot}"))
            .spawn(move || {
                if let Err(err) = run_job(slot, &spec, &worker_end, registry.as_ref()) {
                    debug!(slot, error = %err, "worker finished with error");
                }
            })
            .map_err(|e| PoolError::Spawn(e.to_string()))?;
        Ok(Box::new(ThreadLink {
            endpoints: handle_end,
            thread: Some(thread),
        }))
    }
}

struct ThreadLink {
    endpoints: HandleEndpoints,
    thread: Option<JoinHandle<()>>,
}

impl WorkerLink for ThreadLink {
    fn endpoints(&self) -> &HandleEndpoints {
        &self.endpoints
    }

    fn is_alive(&mut self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process transport
// ---------------------------------------------------------------------------

/// Runs each job in an isolated child process.
///
/// The configured command is expected to call [`worker_main`] with the host's
/// registry. A hang or crash inside the compute routine then cannot corrupt
/// the supervisor: the handle simply observes the child's exit (or stops
/// caring about a child that ignores cancellation).
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    output_buffer: usize,
}

impl ProcessSpawner {
    /// Spawn workers by running `program` (typically
    /// `std::env::current_exe()` with a worker-mode argument).
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output_buffer: DEFAULT_OUTPUT_BUFFER,
        }
    }

    /// Add an argument passed to every worker invocation.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Override the output channel capacity.
    #[must_use]
    pub fn with_output_buffer(mut self, capacity: usize) -> Self {
        self.output_buffer = capacity;
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, slot: usize, spec: JobSpec) -> Result<Box<dyn WorkerLink>, PoolError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        let mut child_in = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("child stdin not captured".into()))?;
        let child_out = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("child stdout not captured".into()))?;

        let bootstrap = WorkerBootstrap { slot, spec };
        let mut line = serde_json::to_string(&bootstrap)
            .map_err(|e| PoolError::Spawn(format!("bootstrap encode: {e}")))?;
        line.push('\n');
        child_in
            .write_all(line.as_bytes())
            .and_then(|()| child_in.flush())
            .map_err(|e| PoolError::Spawn(format!("bootstrap write: {e}")))?;

        let (out_tx, out_rx) = bounded(self.output_buffer);
        let (abort_to_child, abort_to_child_rx) = unbounded::<ProtocolMsg>();
        let (abort_from_child_tx, abort_from_child) = unbounded::<ProtocolMsg>();
        let (result_to_child, result_to_child_rx) = unbounded::<ProtocolMsg>();
        let (result_from_child_tx, result_from_child) = unbounded::<ProtocolMsg>();

        let reader = thread::Builder::new()
            .name(format!("simbatch-demux-{slot}"))
            .spawn(move || {
                demux_frames(child_out, &out_tx, &abort_from_child_tx, &result_from_child_tx);
            })
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        let writer = thread::Builder::new()
            .name(format!("simbatch-mux-{slot}"))
            .spawn(move || {
                mux_frames(child_in, abort_to_child_rx, result_to_child_rx);
            })
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        Ok(Box::new(ProcessLink {
            endpoints: HandleEndpoints {
                output: out_rx,
                abort: Duplex {
                    tx: abort_to_child,
                    rx: abort_from_child,
                },
                result: Duplex {
                    tx: result_to_child,
                    rx: result_from_child,
                },
            },
            child,
            pumps: vec![reader, writer],
        }))
    }
}

/// Demultiplex tagged frames from the child's stdout into the three logical
/// channels. Ends at EOF (child exit) or an unreadable stream.
fn demux_frames(
    stream: impl io::Read,
    out_tx: &Sender<String>,
    abort_tx: &Sender<ProtocolMsg>,
    result_tx: &Sender<ProtocolMsg>,
) {
    for line in BufReader::new(stream).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!(error = %err, "worker stdout closed");
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        match WireMsg::decode(&line) {
            Ok(WireMsg::Output(text)) => {
                let _ = out_tx.send(text);
            }
            Ok(WireMsg::Abort(msg)) => {
                let _ = abort_tx.send(msg);
            }
            Ok(WireMsg::Result(msg)) => {
                let _ = result_tx.send(msg);
            }
            Err(err) => warn!(error = %err, "dropping malformed frame from worker"),
        }
    }
}

/// Multiplex supervisor-to-worker messages onto the child's stdin as tagged
/// frames. Ends once both logical channels disconnect or the child is gone.
fn mux_frames(
    mut stream: impl Write,
    abort_rx: Receiver<ProtocolMsg>,
    result_rx: Receiver<ProtocolMsg>,
) {
    let mut abort_rx = abort_rx;
    let mut result_rx = result_rx;
    let mut abort_open = true;
    let mut result_open = true;
    while abort_open || result_open {
        let frame = crossbeam_channel::select! {
            recv(abort_rx) -> msg => match msg {
                Ok(msg) => Some(WireMsg::Abort(msg)),
                Err(_) => {
                    abort_rx = never();
                    abort_open = false;
                    None
                }
            },
            recv(result_rx) -> msg => match msg {
                Ok(msg) => Some(WireMsg::Result(msg)),
                Err(_) => {
                    result_rx = never();
                    result_open = false;
                    None
                }
            },
        };
        if let Some(frame) = frame {
            if write_frame(&mut stream, &frame).is_err() {
                break;
            }
        }
    }
}

fn write_frame(stream: &mut impl Write, frame: &WireMsg) -> io::Result<()> {
    let mut line = frame
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()
}

struct ProcessLink {
    endpoints: HandleEndpoints,
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

impl WorkerLink for ProcessLink {
    fn endpoints(&self) -> &HandleEndpoints {
        &self.endpoints
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn join(&mut self) {
        match self.child.wait() {
            Ok(status) => debug!(%status, "worker process exited"),
            Err(err) => warn!(error = %err, "failed to reap worker process"),
        }
        // The mux pump exits only once every supervisor-side sender is gone;
        // swap ours for disconnected stand-ins so it can finish.
        let (tx, _) = unbounded();
        self.endpoints.abort.tx = tx;
        let (tx, _) = unbounded();
        self.endpoints.result.tx = tx;
        for pump in self.pumps.drain(..) {
            let _ = pump.join();
        }
    }
}

/// Entry point for a host binary running in worker mode.
///
/// Reads the bootstrap line from stdin, bridges the process's stdio to the
/// three logical channels, runs the job, and returns once the handoff has
/// completed. The host decides how it is invoked (a hidden flag, an env var);
/// no command-line surface belongs to this crate.
///
/// # Errors
///
/// Returns an error if the bootstrap line is missing or malformed, or if the
/// job fails in a way worth reporting through the worker's exit status.
pub fn worker_main<R: JobRegistry>(registry: &R) -> AppResult<()> {
    let stdin = io::stdin();
    let mut first = String::new();
    stdin
        .lock()
        .read_line(&mut first)
        .context("reading bootstrap line")?;
    if first.trim().is_empty() {
        anyhow::bail!("missing bootstrap line on stdin");
    }
    let bootstrap: WorkerBootstrap =
        serde_json::from_str(first.trim()).context("parsing bootstrap line")?;

    let (handle_end, worker_end) = job_channels(DEFAULT_OUTPUT_BUFFER);

    // Inbound pump: remaining stdin frames feed the abort/result endpoints.
    let inbound_abort = handle_end.abort.tx.clone();
    let inbound_result = handle_end.result.tx.clone();
    let reader = thread::Builder::new()
        .name("simbatch-worker-stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if line.is_empty() {
                    continue;
                }
                match WireMsg::decode(&line) {
                    Ok(WireMsg::Abort(msg)) => {
                        let _ = inbound_abort.send(msg);
                    }
                    Ok(WireMsg::Result(msg)) => {
                        let _ = inbound_result.send(msg);
                    }
                    Ok(WireMsg::Output(_)) => {
                        warn!("supervisor sent an output frame; dropping");
                    }
                    Err(err) => warn!(error = %err, "dropping malformed frame from supervisor"),
                }
            }
        })
        .context("spawning stdin pump")?;

    // Outbound pump: output text and worker-side protocol messages go to
    // stdout as tagged frames.
    let out_rx = handle_end.output.clone();
    let abort_rx = handle_end.abort.rx.clone();
    let result_rx = handle_end.result.rx.clone();
    let writer = thread::Builder::new()
        .name("simbatch-worker-stdout".into())
        .spawn(move || {
            let mut stdout = io::stdout().lock();
            let mut out_rx = out_rx;
            let mut abort_rx = abort_rx;
            let mut result_rx = result_rx;
            let (mut out_open, mut abort_open, mut result_open) = (true, true, true);
            while out_open || abort_open || result_open {
                let frame = crossbeam_channel::select! {
                    recv(out_rx) -> msg => match msg {
                        Ok(text) => Some(WireMsg::Output(text)),
                        Err(_) => {
                            out_rx = never();
                            out_open = false;
                            None
                        }
                    },
                    recv(abort_rx) -> msg => match msg {
                        Ok(msg) => Some(WireMsg::Abort(msg)),
                        Err(_) => {
                            abort_rx = never();
                            abort_open = false;
                            None
                        }
                    },
                    recv(result_rx) -> msg => match msg {
                        Ok(msg) => Some(WireMsg::Result(msg)),
                        Err(_) => {
                            result_rx = never();
                            result_open = false;
                            None
                        }
                    },
                };
                if let Some(frame) = frame {
                    if write_frame(&mut stdout, &frame).is_err() {
                        break;
                    }
                }
            }
        })
        .context("spawning stdout pump")?;

    let outcome = run_job(bootstrap.slot, &bootstrap.spec, &worker_end, registry);
    if let Err(err) = &outcome {
        error!(slot = bootstrap.slot, error = %err, "worker job failed");
    }

    // Dropping the worker endpoints disconnects the pumps; the outbound pump
    // then drains and exits, flushing the last frames.
    drop(worker_end);
    drop(handle_end);
    let _ = writer.join();
    drop(reader);

    outcome.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::SolverMethod;

    #[test]
    fn test_duplex_directions() {
        let (a, b) = duplex::<u8, &str>();
        a.tx.send(1).unwrap();
        b.tx.send("hi").unwrap();
        assert_eq!(b.rx.recv().unwrap(), 1);
        assert_eq!(a.rx.recv().unwrap(), "hi");
    }

    #[test]
    fn test_bootstrap_roundtrip() {
        let bootstrap = WorkerBootstrap {
            slot: 4,
            spec: JobSpec {
                id: 11,
                label: "b".into(),
                solver: SolverMethod::Euler { steps: 100 },
                params: std::collections::BTreeMap::new(),
                one_cycle: false,
                plot_every_cycle: false,
            },
        };
        let line = serde_json::to_string(&bootstrap).unwrap();
        let back: WorkerBootstrap = serde_json::from_str(&line).unwrap();
        assert_eq!(back.slot, 4);
        assert_eq!(back.spec.id, 11);
    }

    #[test]
    fn test_mux_writes_tagged_frames() {
        let (abort_tx, abort_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        abort_tx
            .send(ProtocolMsg::AbortRequest {
                correlation: uuid::Uuid::new_v4(),
            })
            .unwrap();
        drop(abort_tx);
        drop(result_tx);

        let mut buf = Vec::new();
        mux_frames(&mut buf, abort_rx, result_rx);
        let text = String::from_utf8(buf).unwrap();
        let frames: Vec<&str> = text.lines().collect();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            WireMsg::decode(frames[0]).unwrap(),
            WireMsg::Abort(ProtocolMsg::AbortRequest { .. })
        ));
    }

    #[test]
    fn test_demux_routes_frames() {
        let (out_tx, out_rx) = unbounded();
        let (abort_tx, abort_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();

        let mut input = String::new();
        input.push_str(&WireMsg::Output("hello\n".into()).encode().unwrap());
        input.push('\n');
        input.push_str("garbage that is not a frame\n");
        input.push_str(
            &WireMsg::Abort(ProtocolMsg::AbortRequest {
                correlation: uuid::Uuid::new_v4(),
            })
            .encode()
            .unwrap(),
        );
        input.push('\n');

        demux_frames(input.as_bytes(), &out_tx, &abort_tx, &result_tx);
        assert_eq!(out_rx.try_recv().unwrap(), "hello\n");
        assert!(abort_rx.try_recv().is_ok());
        assert!(result_rx.try_recv().is_err());
    }
}
