//! Worker-side execution of one job.
//!
//! [`run_job`] is the code that runs behind the isolation boundary: it
//! rebuilds the solver and hooks from the registry, threads an explicit
//! channel-backed output sink through the compute call (no process-wide
//! stdout substitution inside the core), polls the abort endpoint
//! cooperatively, and drives the worker half of the result/abort handoff.

use std::cell::Cell;
use std::io;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::PoolError;
use crate::core::job::{JobRegistry, JobSpec, ResultEnvelope, RunContext};
use crate::core::protocol::{AckToken, ProtocolMsg, ACK_POLL, ACK_WAIT};
use crate::core::spawn::WorkerEndpoints;

/// Text output that forwards every write over the output channel.
///
/// This is the injected replacement for redirecting stdout: the compute call
/// receives it explicitly and the supervisor relays each chunk verbatim to
/// the assigned log sink.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<String>,
}

impl ChannelSink {
    /// Wrap the worker's output-channel sender.
    #[must_use]
    pub fn new(tx: Sender<String>) -> Self {
        Self { tx }
    }

    /// Send text verbatim. Silently dropped if the supervisor is gone; a
    /// worker with no supervisor has nowhere to report that either.
    pub fn write(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }

    /// Send text with a trailing newline.
    pub fn line(&self, text: &str) {
        let _ = self.tx.send(format!("{text}\n"));
    }
}

impl io::Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ChannelSink::write(self, &String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Cooperative cancellation probe backed by the worker's abort endpoint.
///
/// The solver polls this at its own safe points; the probe records the abort
/// request's correlation id so the eventual ack can echo it.
#[derive(Debug)]
pub struct CancelProbe {
    rx: Receiver<ProtocolMsg>,
    fired: Cell<Option<Uuid>>,
    orphaned: Cell<bool>,
    violated: Cell<bool>,
}

impl CancelProbe {
    /// Wrap the worker-side abort receiver.
    #[must_use]
    pub fn new(rx: Receiver<ProtocolMsg>) -> Self {
        Self {
            rx,
            fired: Cell::new(None),
            orphaned: Cell::new(false),
            violated: Cell::new(false),
        }
    }

    /// True once an abort request arrived or the supervisor disconnected.
    #[must_use]
    pub fn poll(&self) -> bool {
        if self.fired.get().is_some() || self.orphaned.get() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(ProtocolMsg::AbortRequest { correlation }) => {
                self.fired.set(Some(correlation));
                true
            }
            Ok(msg) => {
                warn!(?msg, "unexpected message on worker abort endpoint");
                self.violated.set(true);
                false
            }
            Err(crossbeam_channel::TryRecvError::Empty) => false,
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                self.orphaned.set(true);
                true
            }
        }
    }

    /// Correlation id of the abort request, if one arrived.
    #[must_use]
    pub fn correlation(&self) -> Option<Uuid> {
        self.fired.get()
    }

    /// True if a non-abort message arrived on the abort endpoint.
    #[must_use]
    pub fn violated(&self) -> bool {
        self.violated.get()
    }
}

/// Execute exactly one job on this side of the isolation boundary.
///
/// On normal completion the result is sent over the result channel and the
/// worker blocks (bounded poll) until the matching acknowledgment arrives, so
/// the channel is never torn down before the supervisor has read the payload.
/// If cancellation was observed mid-run the result handoff is skipped and the
/// abort request is acknowledged instead.
///
/// # Errors
///
/// Returns `PoolError::Compute` if the registry or solver fails,
/// `PoolError::ProtocolViolation` for a bad or missing acknowledgment, and
/// `PoolError::ChannelClosed` if an endpoint disconnects mid-handoff. All of
/// these are fatal to this worker only; the failure text also goes out on the
/// output channel while the supervisor is still listening.
pub fn run_job<R: JobRegistry + ?Sized>(
    slot: usize,
    spec: &JobSpec,
    endpoints: &WorkerEndpoints,
    registry: &R,
) -> Result<(), PoolError> {
    let sink = ChannelSink::new(endpoints.output.clone());
    let probe = CancelProbe::new(endpoints.abort.rx.clone());
    let started = Instant::now();
    let label = spec.label.as_str();

    debug!(slot, job_id = spec.id, label, "worker starting job");

    let mut solver = match registry.solver(spec) {
        Ok(solver) => solver,
        Err(err) => {
            sink.line(&format!("{label}: solver construction failed: {err:#}"));
            return Err(PoolError::Compute(format!("{err:#}")));
        }
    };
    let mut hooks = registry.hooks(spec);

    let run = {
        let mut ctx = RunContext::new(&sink, &probe, hooks.as_mut());
        match solver.run(spec, &mut ctx) {
            Ok(run) => run,
            Err(err) => {
                sink.line(&format!("{label}: compute failed: {err:#}"));
                return Err(PoolError::Compute(format!("{err:#}")));
            }
        }
    };

    if probe.violated() {
        return Err(PoolError::ProtocolViolation {
            slot,
            detail: "non-abort message on abort channel".into(),
        });
    }

    // Cancellation observed mid-run: skip the result handoff and confirm
    // that teardown is safe.
    if probe.poll() {
        sink.line(&format!("{label}: acknowledging completion of abort"));
        if let Some(correlation) = probe.correlation() {
            endpoints
                .abort
                .tx
                .send(ProtocolMsg::Ack {
                    correlation,
                    token: AckToken::well_known(),
                })
                .map_err(|_| PoolError::ChannelClosed("abort"))?;
        }
        return Ok(());
    }

    let envelope = ResultEnvelope {
        job_id: spec.id,
        label: spec.label.clone(),
        solver: spec.solver,
        cycles_run: run.cycles_run,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        metrics: run.metrics,
    };

    let correlation = Uuid::new_v4();
    endpoints
        .result
        .tx
        .send(ProtocolMsg::Result {
            correlation,
            envelope,
        })
        .map_err(|_| PoolError::ChannelClosed("result"))?;
    sink.line(&format!("{label}: sent result to supervisor"));

    wait_for_result_ack(slot, spec, endpoints, &sink, &probe, correlation)
}

/// Bounded wait for the result acknowledgment.
///
/// A late abort can cross an in-flight result; the correlation ids keep the
/// two handoffs apart, and an abort request arriving here is acknowledged so
/// the supervisor's abort handshake completes instead of deadlocking.
fn wait_for_result_ack(
    slot: usize,
    spec: &JobSpec,
    endpoints: &WorkerEndpoints,
    sink: &ChannelSink,
    probe: &CancelProbe,
    correlation: Uuid,
) -> Result<(), PoolError> {
    let deadline = Instant::now() + ACK_WAIT;
    let label = spec.label.as_str();
    loop {
        match endpoints.result.rx.recv_timeout(ACK_POLL) {
            Ok(ProtocolMsg::Ack {
                correlation: echoed,
                token,
            }) if echoed == correlation && token.is_well_known() => {
                sink.line(&format!("{label}: acknowledgment of receipt accepted"));
                return Ok(());
            }
            Ok(msg) => {
                return Err(PoolError::ProtocolViolation {
                    slot,
                    detail: format!("unexpected message during result handoff: {msg:?}"),
                });
            }
            Err(RecvTimeoutError::Timeout) => {
                if probe.poll() {
                    if let Some(abort_correlation) = probe.correlation() {
                        sink.line(&format!("{label}: acknowledging completion of abort"));
                        let _ = endpoints.abort.tx.send(ProtocolMsg::Ack {
                            correlation: abort_correlation,
                            token: AckToken::well_known(),
                        });
                    }
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(PoolError::ProtocolViolation {
                        slot,
                        detail: "result acknowledgment never arrived".into(),
                    });
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PoolError::ChannelClosed("result"));
            }
        }
    }
}
