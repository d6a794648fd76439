//! Supervision of one worker slot.
//!
//! A [`WorkerHandle`] owns the full lifecycle of one worker: it spawns the
//! worker through the configured transport, relays its output verbatim to the
//! assigned log sink, drives the abort handshake, receives and acknowledges
//! the result, persists it, and fires the caller's done-callback. Everything
//! that can go wrong here is fatal to this slot only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{never, Receiver, RecvTimeoutError};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::core::error::PoolError;
use crate::core::job::{JobSpec, JobState, ResultEnvelope};
use crate::core::persist::{self, ResultExporter};
use crate::core::pool::PoolShared;
use crate::core::protocol::{AckToken, ProtocolMsg};
use crate::core::sink::LogSink;
use crate::core::spawn::{WorkerLink, WorkerSpawner};

/// Callback invoked with each completed result, from the owning handle's
/// thread. Hosts (typically a GUI) must marshal to their own thread safely.
pub type DoneCallback = Arc<dyn Fn(ResultEnvelope) + Send + Sync>;

/// Everything one slot needs to supervise its worker.
pub(crate) struct SlotContext {
    /// Index of this slot, monotonically assigned by the pool.
    pub slot: usize,
    /// The job this slot runs.
    pub spec: JobSpec,
    /// Log sink assigned from the rotation.
    pub sink: Arc<dyn LogSink>,
    /// Pool configuration (poll intervals, persistence layout).
    pub config: Arc<PoolConfig>,
    /// Shared pool state: status board, counters, wake signal.
    pub shared: Arc<PoolShared>,
    /// Caller's completion callback.
    pub done: Option<DoneCallback>,
    /// Structured-dataset exporter collaborator.
    pub exporter: Option<Arc<dyn ResultExporter>>,
}

/// Supervisor for one worker slot.
pub struct WorkerHandle {
    slot: usize,
    abort_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker and its supervising thread.
    pub(crate) fn spawn(
        ctx: SlotContext,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Result<Self, PoolError> {
        let slot = ctx.slot;
        let abort_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&abort_flag);
        let thread = thread::Builder::new()
            .name(format!("simbatch-handle-{slot}"))
            .spawn(move || supervise(&ctx, &spawner, &flag))
            .map_err(|e| PoolError::Spawn(e.to_string()))?;
        Ok(Self {
            slot,
            abort_flag,
            thread: Some(thread),
        })
    }

    /// Slot index of this handle.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Request cooperative cancellation of this slot's worker.
    ///
    /// Sets a single atomic flag read by the supervision loop; safe to call
    /// from any thread and idempotent.
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::Release);
    }

    /// True once the supervision thread has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Join the supervision thread.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(slot = self.slot, "handle thread panicked");
            }
        }
    }
}

/// What the supervision loop observed, fed into the terminal-state decision.
struct Supervision {
    received: Option<ResultEnvelope>,
    violation: Option<String>,
}

fn supervise(ctx: &SlotContext, spawner: &Arc<dyn WorkerSpawner>, abort_flag: &AtomicBool) {
    let label = ctx.spec.label.clone();
    let mut link = match spawner.spawn(ctx.slot, ctx.spec.clone()) {
        Ok(link) => link,
        Err(err) => {
            error!(slot = ctx.slot, error = %err, "could not start worker");
            ctx.sink.append(&format!("{label}: {err}\n"));
            finish(ctx, JobState::Lost);
            return;
        }
    };
    debug!(slot = ctx.slot, job_id = ctx.spec.id, "worker started");

    let outcome = run_supervision(ctx, link.as_mut(), abort_flag);

    link.join();
    drain_output(&link.endpoints().output, ctx.sink.as_ref());

    if let Some(detail) = outcome.violation {
        let err = PoolError::ProtocolViolation {
            slot: ctx.slot,
            detail,
        };
        error!(error = %err, "worker slot failed");
        ctx.sink.append(&format!("{label}: {err}\n"));
        finish(ctx, JobState::Lost);
    } else if abort_flag.load(Ordering::Acquire) {
        info!(slot = ctx.slot, job_id = ctx.spec.id, "worker aborted");
        ctx.sink
            .append(&format!("{label}: worker has aborted successfully\n"));
        finish(ctx, JobState::Aborted);
    } else if let Some(envelope) = outcome.received {
        ctx.sink.append(&format!("{label}: worker is done\n"));
        persist::persist(
            &envelope,
            &ctx.config.temp_dir(),
            &ctx.config.snapshot_prefix,
            ctx.slot,
            ctx.sink.as_ref(),
            ctx.exporter.as_ref(),
        );
        finish(ctx, JobState::Completed);
        if let Some(done) = &ctx.done {
            done(envelope);
        }
    } else {
        let err = PoolError::ProcessDeath { slot: ctx.slot };
        info!(error = %err, job_id = ctx.spec.id, "job lost");
        ctx.sink.append(&format!("{label}: {err}; job lost\n"));
        finish(ctx, JobState::Lost);
    }
}

/// The supervision loop proper: poll liveness at a bounded interval, relay
/// output, complete whichever handoff the worker initiates, and run the abort
/// handshake once the abort flag is observed.
fn run_supervision(
    ctx: &SlotContext,
    link: &mut dyn WorkerLink,
    abort_flag: &AtomicBool,
) -> Supervision {
    let mut out_rx = link.endpoints().output.clone();
    let abort = link.endpoints().abort.clone();
    let result = link.endpoints().result.clone();
    let mut result_rx = result.rx.clone();

    let mut received: Option<ResultEnvelope> = None;
    let mut violation: Option<String> = None;

    'supervise: while link.is_alive() {
        if abort_flag.load(Ordering::Acquire) {
            let correlation = Uuid::new_v4();
            if abort
                .tx
                .send(ProtocolMsg::AbortRequest { correlation })
                .is_err()
            {
                // Worker already tore down its endpoints; the post-exit
                // decision will see the abort flag.
                break 'supervise;
            }
            loop {
                // Keep relaying buffered output while the worker winds down.
                drain_output(&out_rx, ctx.sink.as_ref());
                match abort.rx.recv_timeout(ctx.config.ack_poll()) {
                    Ok(ProtocolMsg::Ack {
                        correlation: echoed,
                        token,
                    }) if echoed == correlation && token.is_well_known() => {
                        break 'supervise;
                    }
                    Ok(msg) => {
                        violation =
                            Some(format!("unexpected message on abort channel: {msg:?}"));
                        break 'supervise;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if !link.is_alive() {
                            break 'supervise;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break 'supervise,
                }
            }
        }

        crossbeam_channel::select! {
            recv(out_rx) -> msg => match msg {
                Ok(text) => ctx.sink.append(&text),
                Err(_) => out_rx = never(),
            },
            recv(result_rx) -> msg => match msg {
                Ok(ProtocolMsg::Result { correlation, envelope }) => {
                    // Acknowledge receipt immediately, completing the handoff.
                    let _ = result.tx.send(ProtocolMsg::Ack {
                        correlation,
                        token: AckToken::well_known(),
                    });
                    received = Some(envelope);
                }
                Ok(msg) => {
                    violation = Some(format!(
                        "unexpected message on result channel: {msg:?}"
                    ));
                    break 'supervise;
                }
                Err(_) => result_rx = never(),
            },
            default(ctx.config.liveness_poll()) => {}
        }
    }

    Supervision {
        received,
        violation,
    }
}

fn drain_output(rx: &Receiver<String>, sink: &dyn LogSink) {
    while let Ok(text) = rx.try_recv() {
        sink.append(&text);
    }
}

/// Record the terminal state and wake the pool loop for reaping.
fn finish(ctx: &SlotContext, state: JobState) {
    ctx.shared.board.set(ctx.spec.id, state);
    ctx.shared.counters.record_terminal(state);
    ctx.shared.notify();
}
