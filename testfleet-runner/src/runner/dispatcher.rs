// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-worker dispatch loop.

use super::{CancelReason, InterruptController, RecycleDecision, RecyclePolicy};
use crate::{
    errors::{DisplayErrorChain, TestRunnerExecuteError, WorkerError},
    queue::WorkQueue,
    reporter::{ResultEntry, ResultLog, TestEventKind},
    time::stopwatch,
    worker::{Worker, WorkerLabel, WorkerPool, WorkerSpawner, WorkerState},
};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use testfleet_metadata::{ExecuteRequest, ExecuteResponse, Outcome, ResourceUsage, Seed, TestId};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// State shared by every dispatcher and the node-only runner.
#[derive(Debug)]
pub(super) struct RunState {
    pub(super) log: ResultLog,
    pub(super) interrupt: InterruptController,
    pub(super) seed: Seed,
    halted: AtomicBool,
    events: UnboundedSender<TestEventKind>,
    completed: AtomicUsize,
    total: usize,
}

impl RunState {
    pub(super) fn new(
        interrupt: InterruptController,
        seed: Seed,
        events: UnboundedSender<TestEventKind>,
        total: usize,
    ) -> Self {
        Self {
            log: ResultLog::new(),
            interrupt,
            seed,
            halted: AtomicBool::new(false),
            events,
            completed: AtomicUsize::new(0),
            total,
        }
    }

    pub(super) fn send(&self, kind: TestEventKind) {
        // The receiver outlives every sender except after a panic, when events don't matter.
        let _ = self.events.send(kind);
    }

    /// Records a completed test and reports it.
    pub(super) fn finish(&self, entry: ResultEntry, show_detail: bool) {
        self.log.push(entry.clone());
        let completed = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        self.send(TestEventKind::TestFinished {
            entry,
            show_detail,
            completed,
            total: self.total,
        });
    }

    /// Stops intake after `test_id` crashed, recording `discarded` as skipped.
    pub(super) fn halt(&self, test_id: TestId, discarded: Vec<TestId>) {
        let skipped = discarded.len();
        self.log.record_skipped(discarded);
        if !self.halted.swap(true, Ordering::AcqRel) {
            self.send(TestEventKind::IntakeHalted { test_id, skipped });
        }
    }

    pub(super) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

pub(super) struct DispatcherContext<S: WorkerSpawner> {
    pub(super) state: RunState,
    pub(super) queue: WorkQueue,
    pub(super) pool: WorkerPool<S>,
    pub(super) policy: RecyclePolicy,
    abort: Mutex<Option<TestRunnerExecuteError>>,
}

impl<S: WorkerSpawner> DispatcherContext<S> {
    pub(super) fn new(
        state: RunState,
        queue: WorkQueue,
        pool: WorkerPool<S>,
        policy: RecyclePolicy,
    ) -> Self {
        Self {
            state,
            queue,
            pool,
            policy,
            abort: Mutex::new(None),
        }
    }

    /// Returns the error that aborted the run, if any.
    pub(super) fn take_abort(&self) -> Option<TestRunnerExecuteError> {
        self.abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_abort(&self, error: TestRunnerExecuteError) {
        let mut abort = self.abort.lock().unwrap_or_else(PoisonError::into_inner);
        if abort.is_none() {
            *abort = Some(error);
        }
    }
}

enum Dispatched {
    Completed(Result<ExecuteResponse, WorkerError>),
    Cancelled(CancelReason),
}

/// Runs tests from the queue on one worker until the queue is empty, intake stops, or the run is
/// cancelled.
///
/// Returns the worker so it can be shut down, or `None` if it was lost and couldn't be replaced.
pub(super) async fn dispatch<S: WorkerSpawner>(
    ctx: Arc<DispatcherContext<S>>,
    mut label: WorkerLabel,
    mut worker: S::Worker,
) -> Option<(WorkerLabel, S::Worker)> {
    let mut token = ctx.state.interrupt.token();

    loop {
        if token.is_cancelled() {
            debug!("worker {label}: run cancelled, stopping");
            break;
        }
        let Some(task) = ctx.queue.take() else {
            debug!("worker {label}: queue is empty, stopping");
            break;
        };

        ctx.pool.set_state(label, WorkerState::Busy);
        ctx.state.send(TestEventKind::TestStarted {
            test_id: task.id.clone(),
            worker: Some(label),
        });
        let request = ExecuteRequest {
            test_id: task.id.clone(),
            path: task.path.clone(),
            seed: ctx.state.seed,
            generation: label.generation,
        };

        let start = stopwatch();
        let dispatched = tokio::select! {
            biased;
            reason = token.cancelled() => Dispatched::Cancelled(reason),
            result = worker.execute(request) => Dispatched::Completed(result),
        };

        let result = match dispatched {
            Dispatched::Completed(result) => result,
            Dispatched::Cancelled(reason) => {
                // The worker may still be running the test. Whatever it sends back is never read.
                warn!(
                    "worker {label}: abandoning in-flight test `{}` ({reason})",
                    task.id
                );
                ctx.pool.set_state(label, WorkerState::Dead);
                return Some((label, worker));
            }
        };
        let result = result.and_then(|response| {
            if response.generation == label.generation {
                Ok(response)
            } else {
                Err(WorkerError::StaleResponse {
                    expected: label.generation,
                    actual: response.generation,
                })
            }
        });

        let (response, worker_lost) = match result {
            Ok(response) => (response, false),
            Err(error) => {
                let info = DisplayErrorChain::new(error).to_string();
                warn!("worker {label}: lost while running `{}`: {info}", task.id);
                let response = ExecuteResponse {
                    test_id: task.id.clone(),
                    generation: label.generation,
                    outcome: Outcome::crash(info),
                    duration: start.elapsed(),
                    resources: ResourceUsage::default(),
                };
                (response, true)
            }
        };
        ctx.pool.set_state(label, WorkerState::Idle);

        let decision = ctx
            .policy
            .decide(&response.outcome, &response.resources, worker_lost);
        let show_detail =
            !(response.outcome.is_crash() && ctx.policy.recycler.exit_on_first_error());
        ctx.state.finish(
            ResultEntry {
                test_id: task.id.clone(),
                outcome: response.outcome,
                duration: response.duration,
                resources: response.resources,
                worker: Some(label),
            },
            show_detail,
        );

        match decision {
            RecycleDecision::Continue => {}
            RecycleDecision::Replace(reason) => {
                info!("recycling worker {label} after `{}`: {reason}", task.id);
                match ctx.pool.replace(label, worker).await {
                    Ok((new_label, new_worker)) => {
                        ctx.state.send(TestEventKind::WorkerRecycled {
                            old: label,
                            new: new_label,
                            reason,
                        });
                        label = new_label;
                        worker = new_worker;
                    }
                    Err(error) => {
                        let error = DisplayErrorChain::new(error).to_string();
                        warn!("worker {label}: replacement failed: {error}");
                        ctx.state.send(TestEventKind::WorkerReplaceFailed {
                            old: label,
                            error: error.into(),
                        });
                        return None;
                    }
                }
            }
            RecycleDecision::DrainAndStop => {
                let discarded = ctx.queue.drain();
                debug!(
                    "worker {label}: `{}` crashed, discarding {} pending tests",
                    task.id,
                    discarded.len()
                );
                ctx.state
                    .halt(task.id, discarded.into_iter().map(|task| task.id).collect());
                break;
            }
            RecycleDecision::Abort { peak_rss, max_rss } => {
                warn!(
                    "worker {label}: `{}` peaked at {peak_rss} on the only worker, aborting",
                    task.id
                );
                ctx.set_abort(TestRunnerExecuteError::MemoryLimitExceeded {
                    test_id: task.id,
                    peak_rss,
                    max_rss,
                });
                ctx.state.interrupt.cancel(CancelReason::MemoryLimit);
                break;
            }
        }
    }

    Some((label, worker))
}
