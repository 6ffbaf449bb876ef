// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    CancelReason, FailureRecycler, InterruptController, MemoryGovernor, RecyclePolicy,
    dispatcher::{DispatcherContext, RunState, dispatch},
    node_only::NodeOnlyRunner,
};
use crate::{
    config::{FleetProfile, MaxRss, SoleWorkerCrash, WorkerCount},
    errors::{TestRunnerBuildError, TestRunnerExecuteError},
    list::{SeedPlan, TestList},
    queue::WorkQueue,
    reporter::{ReportAggregator, RunSummary, TestEvent, TestEventKind},
    signal::{SignalHandler, SignalHandlerKind},
    time::stopwatch,
    worker::{LocalExecutor, WorkerPool, WorkerSpawner},
};
use debug_ignore::DebugIgnore;
use std::{net::TcpListener, sync::Arc, time::Duration};
use testfleet_metadata::{Seed, TestId};
use tokio::{
    runtime::Runtime,
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
    task::JoinSet,
    time::{Instant, sleep_until},
};
use tracing::{debug, warn};

/// Test runner options.
///
/// Every setting falls back to the profile when unset.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    workers: Option<WorkerCount>,
    max_rss: Option<MaxRss>,
    force_multiprocess: Option<bool>,
    exit_on_first_error: Option<bool>,
    sole_worker_crash: Option<SoleWorkerCrash>,
    seed: Option<Seed>,
}

impl TestRunnerBuilder {
    /// Sets the requested number of workers.
    pub fn set_workers(&mut self, workers: WorkerCount) -> &mut Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the peak RSS above which workers are recycled.
    pub fn set_max_rss(&mut self, max_rss: MaxRss) -> &mut Self {
        self.max_rss = Some(max_rss);
        self
    }

    /// Uses a worker pool even if loopback networking is unavailable.
    pub fn set_force_multiprocess(&mut self, force_multiprocess: bool) -> &mut Self {
        self.force_multiprocess = Some(force_multiprocess);
        self
    }

    /// Stops intake at the first crash.
    pub fn set_exit_on_first_error(&mut self, exit_on_first_error: bool) -> &mut Self {
        self.exit_on_first_error = Some(exit_on_first_error);
        self
    }

    /// Sets what happens when a test crashes on a single-worker pool.
    pub fn set_sole_worker_crash(&mut self, sole_worker_crash: SoleWorkerCrash) -> &mut Self {
        self.sole_worker_crash = Some(sole_worker_crash);
        self
    }

    /// Sets the RNG seed handed to every test.
    pub fn set_seed(&mut self, seed: Seed) -> &mut Self {
        self.seed = Some(seed);
        self
    }

    /// Creates a new test runner.
    ///
    /// `spawner` starts the pool's workers and `local` runs node-pinned tests in this process.
    pub fn build<S: WorkerSpawner, L: LocalExecutor>(
        self,
        test_list: &TestList,
        profile: &FleetProfile<'_>,
        signal_handler: SignalHandlerKind,
        spawner: S,
        local: L,
    ) -> Result<TestRunner<S, L>, TestRunnerBuildError> {
        let plan = test_list.partition(profile.front_load());
        let force_multiprocess = self
            .force_multiprocess
            .unwrap_or_else(|| profile.force_multiprocess());
        let requested = self
            .workers
            .unwrap_or_else(|| profile.workers())
            .compute();
        let pool_size = compute_pool_size(requested, plan.pool.len(), force_multiprocess);

        let seed = self
            .seed
            .or_else(|| profile.seed())
            .unwrap_or_else(|| Seed::new(rand::random()));
        let max_rss = self.max_rss.unwrap_or_else(|| profile.max_rss());
        let exit_on_first_error = self
            .exit_on_first_error
            .unwrap_or_else(|| profile.exit_on_first_error());
        let sole_worker_crash = self
            .sole_worker_crash
            .unwrap_or_else(|| profile.sole_worker_crash());
        let policy = RecyclePolicy {
            recycler: FailureRecycler::new(exit_on_first_error, sole_worker_crash, pool_size),
            governor: MemoryGovernor::new(max_rss, pool_size),
        };
        debug!(
            "pool of {pool_size} workers for {} tests (requested {requested}), {} node-pinned",
            plan.pool.len(),
            plan.node_pinned.len(),
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("testfleet-runner-worker")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler.build()?;

        Ok(TestRunner {
            inner: TestRunnerInner {
                plan,
                pool_size,
                seed,
                max_rss,
                policy,
                shared_state_test: profile.shared_state_test().cloned(),
                shutdown_grace: profile.worker_shutdown_grace(),
                interrupt_grace: profile.interrupt_grace(),
                interrupt: InterruptController::new(),
                spawner: DebugIgnore(spawner),
                local: DebugIgnore(local),
            },
            runtime,
            signal_handler,
        })
    }
}

/// Returns the number of workers to start.
///
/// The pool never has more workers than tests. Without loopback networking, workers can't be
/// relied on, so a single one is used unless multiprocess mode is forced.
fn compute_pool_size(requested: usize, pool_test_count: usize, force_multiprocess: bool) -> usize {
    if pool_test_count == 0 {
        return 0;
    }
    if force_multiprocess || loopback_available() {
        requested.clamp(1, pool_test_count)
    } else {
        debug!("loopback networking unavailable, using a single worker");
        1
    }
}

fn loopback_available() -> bool {
    TcpListener::bind(("127.0.0.1", 0)).is_ok()
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner<S, L> {
    inner: TestRunnerInner<S, L>,
    runtime: Runtime,
    signal_handler: SignalHandler,
}

impl<S: WorkerSpawner, L: LocalExecutor> TestRunner<S, L> {
    /// Returns the number of workers the pool will start.
    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Returns the seed the run will use.
    pub fn seed(&self) -> Seed {
        self.inner.seed
    }

    /// Returns a controller that can cancel this run from outside, in addition to signals.
    pub fn interrupt_controller(&self) -> InterruptController {
        self.inner.interrupt.clone()
    }

    /// Runs every test: the pool tests across the workers, then node-pinned tests in this process.
    ///
    /// The callback is called with each event as it happens, from a single thread.
    ///
    /// Returns the aggregated summary, or an error if the run was aborted before a summary could
    /// be produced.
    ///
    /// # Panics
    ///
    /// Re-raises panics from dispatcher tasks.
    pub fn execute<F>(self, callback: F) -> Result<RunSummary, TestRunnerExecuteError>
    where
        F: FnMut(TestEvent) + Send,
    {
        let Self {
            inner,
            runtime,
            mut signal_handler,
        } = self;
        let result = runtime.block_on(inner.run(&mut signal_handler, callback));

        // Workers that ignored their shutdown request may still hold runtime resources. Don't wait
        // for them.
        runtime.shutdown_background();
        result
    }
}

#[derive(Debug)]
struct TestRunnerInner<S, L> {
    plan: SeedPlan,
    pool_size: usize,
    seed: Seed,
    max_rss: MaxRss,
    policy: RecyclePolicy,
    shared_state_test: Option<TestId>,
    shutdown_grace: Duration,
    interrupt_grace: Duration,
    interrupt: InterruptController,
    spawner: DebugIgnore<S>,
    local: DebugIgnore<L>,
}

impl<S: WorkerSpawner, L: LocalExecutor> TestRunnerInner<S, L> {
    async fn run<F>(
        self,
        signal_handler: &mut SignalHandler,
        mut callback: F,
    ) -> Result<RunSummary, TestRunnerExecuteError>
    where
        F: FnMut(TestEvent),
    {
        let Self {
            plan,
            pool_size,
            seed,
            max_rss,
            policy,
            shared_state_test,
            shutdown_grace,
            interrupt_grace,
            interrupt,
            spawner: DebugIgnore(spawner),
            local: DebugIgnore(local),
        } = self;

        let stopwatch = stopwatch();
        let mut emit = |kind| callback(TestEvent::new(&stopwatch, kind));
        emit(TestEventKind::RunStarted {
            pool_size,
            pool_test_count: plan.pool.len(),
            node_pinned_count: plan.node_pinned.len(),
            seed,
            max_rss,
        });

        let (events_tx, mut events_rx) = unbounded_channel();
        let total = plan.pool.len() + plan.node_pinned.len();
        let state = RunState::new(interrupt.clone(), seed, events_tx, total);
        let queue = WorkQueue::new();
        queue.seed(plan.pool.iter().cloned());
        let ctx = Arc::new(DispatcherContext::new(
            state,
            queue,
            WorkerPool::new(spawner, shutdown_grace),
            policy,
        ));

        // ---
        // Pool phase
        // ---

        let workers = if pool_size > 0 {
            ctx.pool.spawn(pool_size).await?
        } else {
            Vec::new()
        };
        let mut dispatchers = JoinSet::new();
        for (label, worker) in workers {
            dispatchers.spawn(dispatch(ctx.clone(), label, worker));
        }

        let mut survivors = Vec::new();
        let mut token = interrupt.token();
        let mut cancel_seen = false;
        let mut signals_done = false;
        let mut abort_deadline: Option<Instant> = None;

        loop {
            // Events and cancellation are handled before the barrier can complete, so neither is
            // lost when the last dispatcher exits.
            tokio::select! {
                biased;
                Some(kind) = events_rx.recv() => emit(kind),
                reason = token.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    abort_deadline = Some(Instant::now() + interrupt_grace);
                    emit(TestEventKind::RunBeginCancel {
                        reason,
                        running: dispatchers.len(),
                    });
                }
                event = signal_handler.recv(), if !signals_done => match event {
                    Some(event) => {
                        interrupt.cancel(CancelReason::Signal(event));
                    }
                    None => signals_done = true,
                },
                () = sleep_until(abort_deadline.unwrap_or_else(Instant::now)),
                    if abort_deadline.is_some() =>
                {
                    abort_deadline = None;
                    let count = dispatchers.len();
                    warn!("aborting {count} dispatchers that didn't stop within the grace period");
                    // Dropping an aborted dispatcher drops its worker, which kills the process.
                    dispatchers.abort_all();
                    emit(TestEventKind::DispatchersAborted { count });
                }
                joined = dispatchers.join_next() => match joined {
                    Some(Ok(Some(worker))) => survivors.push(worker),
                    Some(Ok(None)) => {}
                    Some(Err(error)) => {
                        if error.is_panic() {
                            std::panic::resume_unwind(error.into_panic());
                        }
                        // Cancelled by abort_all above.
                    }
                    None => break,
                },
            }
        }
        drain_events(&mut events_rx, &mut emit);

        if let Some(error) = ctx.take_abort() {
            ctx.pool.shutdown_all(survivors).await;
            drain_events(&mut events_rx, &mut emit);
            return Err(error);
        }
        ctx.pool.shutdown_all(survivors).await;

        // ---
        // Node-only phase
        // ---

        let node_only = NodeOnlyRunner::new(
            &local,
            shared_state_test.as_ref(),
            policy.recycler.exit_on_first_error(),
        );
        {
            let node_only_fut = node_only.run(&plan.node_pinned, &ctx.state);
            tokio::pin!(node_only_fut);
            loop {
                tokio::select! {
                    () = &mut node_only_fut => break,
                    Some(kind) = events_rx.recv() => emit(kind),
                    event = signal_handler.recv(), if !signals_done => match event {
                        Some(event) => {
                            interrupt.cancel(CancelReason::Signal(event));
                        }
                        None => signals_done = true,
                    },
                }
            }
        }
        drain_events(&mut events_rx, &mut emit);

        let snapshot = stopwatch.snapshot();
        let summary = ReportAggregator::new(&plan).aggregate(
            ctx.state.log.entries(),
            &ctx.state.log.skipped(),
            seed,
            snapshot.start_time,
            snapshot.duration,
        );
        debug!(
            "run finished: {} results, {} skipped, {} interrupted",
            summary.nodes.len(),
            summary.skipped_count,
            summary.interrupted_count,
        );
        Ok(summary)
    }
}

fn drain_events(
    events_rx: &mut UnboundedReceiver<TestEventKind>,
    emit: &mut impl FnMut(TestEventKind),
) {
    while let Ok(kind) = events_rx.try_recv() {
        emit(kind);
    }
}
