//! Host-driven event loop shared by the QuickJS and Boa backends.
//!
//! Engines own their microtask queues; timers and channel completions live
//! in the instance [`Scheduler`](crate::scheduler::Scheduler). Each turn runs
//! microtasks to exhaustion, then hands at most one macrotask to script.

use crate::channels;
use crate::error::{Error, Result};
use crate::evaluation::{EvaluationResult, PromiseHandle};
use crate::instances::InstanceState;
use crate::prelude;
use crate::scheduler::{Macrotask, MacrotaskKind};
use futures::future;
use std::pin::pin;
use std::sync::Arc;

/// State of a promise held by an engine instance.
#[derive(Debug)]
pub enum PromiseProgress {
    Pending,
    /// Fulfilled or rejected; rejections arrive as error results.
    Settled(EvaluationResult),
}

/// What an engine must expose for the host to pump it.
pub trait LoopBackend {
    fn state(&self) -> &Arc<InstanceState>;

    /// Run queued microtasks until none remain. Returns how many ran, or 0
    /// when the engine cannot count them.
    fn run_microtasks(&mut self) -> Result<usize>;

    /// Evaluate host-generated glue code. Script exceptions surface as
    /// [`Error::Evaluation`].
    fn eval_glue(&mut self, code: &str) -> Result<()>;

    fn promise_progress(&mut self, handle: PromiseHandle) -> Result<PromiseProgress>;

    /// Release the engine's reference to a promise.
    fn forget_promise(&mut self, handle: PromiseHandle);
}

/// Deliver one macrotask into script. A throwing job is logged and skipped.
pub fn deliver<B: LoopBackend + ?Sized>(backend: &mut B, task: &Macrotask) -> Result<()> {
    let code = match &task.kind {
        MacrotaskKind::TimerFired { timer_id } => prelude::fire_timer(*timer_id),
        MacrotaskKind::ChannelComplete { call_id, outcome } => {
            prelude::settle_call(*call_id, outcome)
        }
    };
    match backend.eval_glue(&code) {
        Ok(()) => Ok(()),
        Err(Error::Evaluation { message, .. }) => {
            tracing::warn!(
                event = "event_loop.job.failed",
                instance = %backend.state().id(),
                seq = %task.seq,
                error = %message,
                "Pending job threw; skipping"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// One non-blocking turn: microtasks, parked-call polling, one macrotask.
/// Returns the number of jobs executed and whether a macrotask ran.
fn turn<B: LoopBackend + ?Sized>(backend: &mut B) -> Result<(usize, bool)> {
    let mut executed = backend.run_microtasks()?;
    channels::poll_parked_now(backend.state());
    // The scheduler guard must be released before script runs again.
    let task = backend.state().scheduler().tick();
    let ran = match task {
        Some(task) => {
            deliver(backend, &task)?;
            executed += 1;
            true
        }
        None => false,
    };
    Ok((executed, ran))
}

/// Execute every job that is ready right now without waiting on timers or
/// host futures. Returns the number executed.
pub fn drain<B: LoopBackend + ?Sized>(backend: &mut B) -> Result<usize> {
    let mut total = 0;
    loop {
        let (executed, ran) = turn(backend)?;
        total += executed;
        if !ran {
            break;
        }
    }
    // Microtasks queued by the last macrotask.
    total += backend.run_microtasks()?;
    tracing::trace!(
        event = "event_loop.drain",
        instance = %backend.state().id(),
        executed = total,
        "Drained pending jobs"
    );
    Ok(total)
}

/// Drive the loop until `handle` settles.
///
/// Waits on parked channel futures and on the instance clock for pending
/// timers. When nothing can make progress the unresolved promise is surfaced
/// as `pending` unchanged.
pub async fn reconcile<B: LoopBackend + ?Sized>(
    backend: &mut B,
    handle: PromiseHandle,
    pending: EvaluationResult,
) -> Result<EvaluationResult> {
    loop {
        backend.run_microtasks()?;
        if let PromiseProgress::Settled(result) = backend.promise_progress(handle)? {
            backend.forget_promise(handle);
            tracing::debug!(
                event = "engine.promise.settled",
                instance = %backend.state().id(),
                promise = %handle,
                rejected = result.is_error(),
                "Promise settled"
            );
            return Ok(result);
        }

        let (_, ran) = turn(backend)?;
        if ran {
            continue;
        }

        let state = Arc::clone(backend.state());
        let parked = !state.parked().is_empty();
        let wait = state.scheduler().time_until_next_timer();
        match (parked, wait) {
            (false, None) => {}
            (true, None) => {
                channels::next_parked_completion(&state).await;
                continue;
            }
            (parked, Some(ms)) => {
                tracing::trace!(
                    event = "event_loop.wait_timer",
                    instance = %state.id(),
                    wait_ms = ms,
                    parked,
                    "Waiting for next timer"
                );
                let timer = state.clock().sleep(ms);
                if parked {
                    let completion = pin!(channels::next_parked_completion(&state));
                    future::select(completion, timer).await;
                } else {
                    timer.await;
                }
                continue;
            }
        }

        tracing::debug!(
            event = "engine.promise.stalled",
            instance = %state.id(),
            promise = %handle,
            "Promise cannot make progress; returning it unresolved"
        );
        return Ok(pending);
    }
}
