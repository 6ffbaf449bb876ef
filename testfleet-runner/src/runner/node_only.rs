// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::dispatcher::RunState;
use crate::{
    list::TestTask,
    reporter::{ResultEntry, TestEventKind},
    worker::{Isolation, LocalExecutor},
};
use testfleet_metadata::{ExecuteRequest, TestId};
use tracing::{debug, warn};

/// Runs node-pinned tests in the controller, one at a time, after the pool has drained.
///
/// Outcomes go to the same result log as pool outcomes. Nothing here is ever recycled: a crash
/// only stops the remaining tests if exit-on-first-error is set.
pub(super) struct NodeOnlyRunner<'a, L> {
    local: &'a L,
    shared_state_test: Option<&'a TestId>,
    exit_on_first_error: bool,
}

impl<'a, L: LocalExecutor> NodeOnlyRunner<'a, L> {
    pub(super) fn new(
        local: &'a L,
        shared_state_test: Option<&'a TestId>,
        exit_on_first_error: bool,
    ) -> Self {
        Self {
            local,
            shared_state_test,
            exit_on_first_error,
        }
    }

    /// Runs `tasks` in order.
    ///
    /// Node-pinned tests never enter the work queue, so a halt during the pool phase doesn't
    /// discard them. If the run is cancelled, the current test is abandoned and the rest are left
    /// for the aggregator to report as interrupted.
    pub(super) async fn run(&self, tasks: &[TestTask], state: &RunState) {
        if tasks.is_empty() {
            return;
        }

        let mut token = state.interrupt.token();
        if token.is_cancelled() {
            return;
        }
        state.send(TestEventKind::NodeOnlyStarted { count: tasks.len() });

        for (index, task) in tasks.iter().enumerate() {
            if token.is_cancelled() {
                break;
            }

            state.send(TestEventKind::TestStarted {
                test_id: task.id.clone(),
                worker: None,
            });
            let request = ExecuteRequest {
                test_id: task.id.clone(),
                path: task.path.clone(),
                seed: state.seed,
                generation: 0,
            };
            let isolation = self.isolation_for(task);
            debug!("running node-pinned test `{}` ({isolation:?})", task.id);

            let response = tokio::select! {
                biased;
                reason = token.cancelled() => {
                    warn!("abandoning node-pinned test `{}` ({reason})", task.id);
                    break;
                }
                response = self.local.execute_local(request, isolation) => response,
            };

            let crashed = response.outcome.is_crash();
            state.finish(
                ResultEntry {
                    test_id: task.id.clone(),
                    outcome: response.outcome,
                    duration: response.duration,
                    resources: response.resources,
                    worker: None,
                },
                !(crashed && self.exit_on_first_error),
            );

            if crashed && self.exit_on_first_error {
                let rest = tasks[index + 1..].iter().map(|task| task.id.clone());
                state.halt(task.id.clone(), rest.collect());
                break;
            }
        }
    }

    fn isolation_for(&self, task: &TestTask) -> Isolation {
        if task.isolated && self.shared_state_test != Some(&task.id) {
            Isolation::Sandboxed
        } else {
            Isolation::Inherit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CancelReason, InterruptController};
    use pretty_assertions::assert_eq;
    use std::{sync::Mutex, time::Duration};
    use testfleet_metadata::{ExecuteResponse, Outcome, ResourceUsage, Seed, TestSummary};
    use tokio::sync::mpsc::unbounded_channel;

    #[derive(Debug, Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(TestId, Isolation)>>,
    }

    impl LocalExecutor for RecordingExecutor {
        async fn execute_local(
            &self,
            request: ExecuteRequest,
            isolation: Isolation,
        ) -> ExecuteResponse {
            self.calls
                .lock()
                .unwrap()
                .push((request.test_id.clone(), isolation));
            let outcome = if request.test_id.as_str().starts_with("crash") {
                Outcome::crash("boom")
            } else {
                Outcome::Pass {
                    summary: TestSummary::default(),
                }
            };
            ExecuteResponse {
                test_id: request.test_id,
                generation: request.generation,
                outcome,
                duration: Duration::from_millis(5),
                resources: ResourceUsage::default(),
            }
        }
    }

    fn pinned(id: &str, isolated: bool) -> TestTask {
        TestTask {
            id: TestId::new(id),
            path: format!("{id}.sh").into(),
            is_node_pinned: true,
            isolated,
        }
    }

    fn state() -> RunState {
        // Events aren't inspected here, and sends to a closed channel are ignored.
        let (tx, _) = unbounded_channel();
        RunState::new(InterruptController::new(), Seed::new(7), tx, 3)
    }

    #[tokio::test]
    async fn pinning_order_and_isolation() {
        let executor = RecordingExecutor::default();
        let shared = TestId::new("shared");
        let runner = NodeOnlyRunner::new(&executor, Some(&shared), false);
        let tasks = [
            pinned("isolated", true),
            pinned("shared", true),
            pinned("opted-out", false),
        ];
        let state = state();
        runner.run(&tasks, &state).await;

        assert_eq!(
            *executor.calls.lock().unwrap(),
            [
                (TestId::new("isolated"), Isolation::Sandboxed),
                (TestId::new("shared"), Isolation::Inherit),
                (TestId::new("opted-out"), Isolation::Inherit),
            ]
        );
        let ids: Vec<_> = state
            .log
            .entries()
            .into_iter()
            .map(|entry| entry.test_id)
            .collect();
        assert_eq!(
            ids,
            [
                TestId::new("isolated"),
                TestId::new("shared"),
                TestId::new("opted-out"),
            ]
        );
    }

    #[tokio::test]
    async fn crash_with_exit_on_first_error_skips_the_rest() {
        let executor = RecordingExecutor::default();
        let runner = NodeOnlyRunner::new(&executor, None, true);
        let tasks = [pinned("crash-a", true), pinned("b", true), pinned("c", true)];
        let state = state();
        runner.run(&tasks, &state).await;

        assert_eq!(executor.calls.lock().unwrap().len(), 1);
        assert_eq!(state.log.skipped(), [TestId::new("b"), TestId::new("c")]);
        assert!(state.is_halted());
    }

    #[tokio::test]
    async fn pool_halt_does_not_skip_pinned_tests() {
        let executor = RecordingExecutor::default();
        let runner = NodeOnlyRunner::new(&executor, None, true);
        let state = state();
        state.halt(TestId::new("pool-crash"), vec![TestId::new("pool-b")]);
        runner
            .run(&[pinned("n", true), pinned("m", true)], &state)
            .await;

        assert_eq!(executor.calls.lock().unwrap().len(), 2);
        assert_eq!(state.log.completed_count(), 2);
        assert_eq!(state.log.skipped(), [TestId::new("pool-b")]);
    }

    #[tokio::test]
    async fn crash_without_exit_on_first_error_continues() {
        let executor = RecordingExecutor::default();
        let runner = NodeOnlyRunner::new(&executor, None, false);
        let tasks = [pinned("crash-a", true), pinned("b", true)];
        let state = state();
        runner.run(&tasks, &state).await;

        assert_eq!(state.log.completed_count(), 2);
        assert!(state.log.skipped().is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_leaves_tasks_untouched() {
        let executor = RecordingExecutor::default();
        let runner = NodeOnlyRunner::new(&executor, None, false);
        let state = state();
        state.interrupt.cancel(CancelReason::MemoryLimit);
        runner.run(&[pinned("a", true)], &state).await;

        assert!(executor.calls.lock().unwrap().is_empty());
        assert_eq!(state.log.completed_count(), 0);
        assert!(state.log.skipped().is_empty());
    }
}
