// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns the result log into the final report tree and verdict.

use super::ResultEntry;
use crate::{errors::RunFailedError, list::SeedPlan, worker::WorkerLabel};
use chrono::{DateTime, FixedOffset};
use indexmap::IndexMap;
use itertools::{Either, Itertools};
use std::{collections::HashSet, fmt, time::Duration};
use testfleet_metadata::{FailureDetail, FailureKind, Outcome, ResourceUsage, Seed, TestId};
use tracing::warn;

/// Builds a [`RunSummary`] from the result log.
///
/// Nodes are ordered as: pool results in completion order, then pool tests that never completed
/// in queue order, then node-pinned tests in pinning order.
#[derive(Clone, Copy, Debug)]
pub struct ReportAggregator<'a> {
    plan: &'a SeedPlan,
}

impl<'a> ReportAggregator<'a> {
    /// Creates an aggregator for the given plan.
    pub fn new(plan: &'a SeedPlan) -> Self {
        Self { plan }
    }

    /// Aggregates results. Every test in the plan produces exactly one node: tests with no entry
    /// are reported as skipped if listed in `skipped`, and as interrupted otherwise.
    pub fn aggregate(
        &self,
        entries: Vec<ResultEntry>,
        skipped: &[TestId],
        seed: Seed,
        start_time: DateTime<FixedOffset>,
        elapsed: Duration,
    ) -> RunSummary {
        let skipped: HashSet<&TestId> = skipped.iter().collect();
        let not_run = |id: &TestId| {
            if skipped.contains(id) {
                NotRunCause::Skipped
            } else {
                NotRunCause::Interrupted
            }
        };

        let pool_ids: HashSet<&TestId> = self.plan.pool.iter().map(|task| &task.id).collect();
        let mut nodes = Vec::with_capacity(self.plan.pool.len() + self.plan.node_pinned.len());

        // Pool entries keep the log's completion order.
        let (pool_entries, mut rest): (Vec<ResultEntry>, IndexMap<TestId, ResultEntry>) =
            entries.into_iter().partition_map(|entry| {
                if pool_ids.contains(&entry.test_id) {
                    Either::Left(entry)
                } else {
                    Either::Right((entry.test_id.clone(), entry))
                }
            });
        let completed_pool: HashSet<TestId> = pool_entries
            .iter()
            .map(|entry| entry.test_id.clone())
            .collect();
        nodes.extend(pool_entries.into_iter().map(ReportNode::from_entry));

        for task in &self.plan.pool {
            if !completed_pool.contains(&task.id) {
                nodes.push(ReportNode::not_run(task.id.clone(), not_run(&task.id)));
            }
        }

        for task in &self.plan.node_pinned {
            match rest.shift_remove(&task.id) {
                Some(entry) => nodes.push(ReportNode::from_entry(entry)),
                None => nodes.push(ReportNode::not_run(task.id.clone(), not_run(&task.id))),
            }
        }

        for id in rest.keys() {
            warn!("result for `{id}` doesn't match any planned test, ignoring");
        }

        let skipped_count = nodes
            .iter()
            .filter(|node| node.status == NodeStatus::NotRun(NotRunCause::Skipped))
            .count();
        let interrupted_count = nodes
            .iter()
            .filter(|node| node.status == NodeStatus::NotRun(NotRunCause::Interrupted))
            .count();

        RunSummary {
            nodes,
            skipped_count,
            interrupted_count,
            seed,
            start_time,
            elapsed,
        }
    }
}

/// The final verdict of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Every test passed.
    Pass,

    /// At least one test didn't pass.
    Fail,
}

/// The root of the report for a run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// One node per test.
    pub nodes: Vec<ReportNode>,

    /// The number of tests discarded after intake was halted.
    pub skipped_count: usize,

    /// The number of tests that never completed because the run was cancelled.
    pub interrupted_count: usize,

    /// The RNG seed the run used.
    pub seed: Seed,

    /// The time the run started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the run took.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Returns [`Verdict::Pass`] if every node is fully passing.
    pub fn verdict(&self) -> Verdict {
        if self.nodes.iter().all(ReportNode::is_passing) {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    /// Returns the sum of all node counts.
    pub fn totals(&self) -> NodeCounts {
        self.nodes
            .iter()
            .fold(NodeCounts::default(), |acc, node| acc + node.counts)
    }

    /// Returns the number of nodes with the given status.
    pub fn count_status(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|node| node.status == status).count()
    }

    /// Returns an error describing the failure if the verdict is [`Verdict::Fail`].
    pub fn check(&self) -> Result<(), RunFailedError> {
        match self.verdict() {
            Verdict::Pass => Ok(()),
            Verdict::Fail => Err(RunFailedError {
                failed: self.count_status(NodeStatus::Failed),
                crashed: self.count_status(NodeStatus::Crashed),
                interrupted: self.interrupted_count,
                skipped: self.skipped_count,
            }),
        }
    }
}

/// Check counts for a node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NodeCounts {
    /// Passing checks.
    pub pass: u64,

    /// Failed checks.
    pub fail: u64,

    /// Checks that raised errors.
    pub error: u64,

    /// Known-broken checks.
    pub broken: u64,
}

impl std::ops::Add for NodeCounts {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            pass: self.pass + other.pass,
            fail: self.fail + other.fail,
            error: self.error + other.error,
            broken: self.broken + other.broken,
        }
    }
}

/// Why a test never produced a result.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NotRunCause {
    /// The run was cancelled before the test completed.
    Interrupted,

    /// The test was discarded after intake was halted.
    Skipped,
}

impl fmt::Display for NotRunCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "interrupted"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// The status of a [`ReportNode`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeStatus {
    /// Fully passing.
    Passed,

    /// One or more structured failures.
    Failed,

    /// The test crashed.
    Crashed,

    /// The test never produced a result.
    NotRun(NotRunCause),
}

/// The report for a single test.
///
/// Passing and broken checks are kept as counts in [`counts`](Self::counts) rather than as
/// individual result events. Only non-passing results are stored one by one, in the order the
/// test recorded them. The verdict depends only on whether any failure or crash exists.
#[derive(Clone, Debug)]
pub struct ReportNode {
    /// The test.
    pub name: TestId,

    /// How long the test took. Zero for tests that didn't run.
    pub duration: Duration,

    /// Resources reported for the test.
    pub resources: ResourceUsage,

    /// The worker that ran the test, if any.
    pub worker: Option<WorkerLabel>,

    /// Check counts.
    pub counts: NodeCounts,

    /// Non-passing results, in order.
    pub results: Vec<FailureDetail>,

    /// The node's status.
    pub status: NodeStatus,
}

impl ReportNode {
    /// Returns true if this node is fully passing.
    pub fn is_passing(&self) -> bool {
        self.status == NodeStatus::Passed
    }

    fn from_entry(entry: ResultEntry) -> Self {
        let (counts, results, status) = match entry.outcome {
            Outcome::Pass { summary } => (
                NodeCounts {
                    pass: summary.pass_count,
                    broken: summary.broken_count,
                    ..Default::default()
                },
                Vec::new(),
                NodeStatus::Passed,
            ),
            Outcome::StructuredFailure {
                pass_count,
                broken_count,
                failures,
            } => {
                let mut counts = NodeCounts {
                    pass: pass_count,
                    broken: broken_count,
                    ..Default::default()
                };
                for failure in &failures {
                    match failure.kind {
                        FailureKind::Fail => counts.fail += 1,
                        FailureKind::Error => counts.error += 1,
                    }
                }
                let status = if failures.is_empty() {
                    NodeStatus::Passed
                } else {
                    NodeStatus::Failed
                };
                (counts, failures, status)
            }
            Outcome::OpaqueCrash { info } => (
                NodeCounts {
                    error: 1,
                    ..Default::default()
                },
                vec![FailureDetail::new(FailureKind::Error, info)],
                NodeStatus::Crashed,
            ),
        };

        Self {
            name: entry.test_id,
            duration: entry.duration,
            resources: entry.resources,
            worker: entry.worker,
            counts,
            results,
            status,
        }
    }

    fn not_run(name: TestId, cause: NotRunCause) -> Self {
        let (counts, results) = match cause {
            NotRunCause::Interrupted => (
                NodeCounts {
                    error: 1,
                    ..Default::default()
                },
                vec![FailureDetail::new(FailureKind::Error, "interrupted")],
            ),
            NotRunCause::Skipped => (NodeCounts::default(), Vec::new()),
        };
        Self {
            name,
            duration: Duration::ZERO,
            resources: ResourceUsage::default(),
            worker: None,
            counts,
            results,
            status: NodeStatus::NotRun(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::TestTask;
    use chrono::Local;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_strategy::proptest;
    use testfleet_metadata::TestSummary;

    fn task(id: &str, is_node_pinned: bool) -> TestTask {
        TestTask {
            id: TestId::new(id),
            path: id.into(),
            is_node_pinned,
            isolated: true,
        }
    }

    fn entry(id: &str, outcome: Outcome) -> ResultEntry {
        ResultEntry {
            test_id: TestId::new(id),
            outcome,
            duration: Duration::from_millis(10),
            resources: ResourceUsage::default(),
            worker: Some(WorkerLabel::new(0)),
        }
    }

    fn aggregate(plan: &SeedPlan, entries: Vec<ResultEntry>, skipped: &[TestId]) -> RunSummary {
        ReportAggregator::new(plan).aggregate(
            entries,
            skipped,
            Seed::new(0x2a),
            Local::now().fixed_offset(),
            Duration::from_secs(1),
        )
    }

    fn names(summary: &RunSummary) -> Vec<&str> {
        summary.nodes.iter().map(|node| node.name.as_str()).collect()
    }

    #[test]
    fn pass_failure_crash() {
        let plan = SeedPlan {
            pool: vec![task("a", false), task("b", false), task("c", false)],
            node_pinned: Vec::new(),
        };
        let summary = aggregate(
            &plan,
            vec![
                entry(
                    "a",
                    Outcome::Pass {
                        summary: TestSummary {
                            pass_count: 3,
                            broken_count: 1,
                        },
                    },
                ),
                entry(
                    "b",
                    Outcome::StructuredFailure {
                        pass_count: 2,
                        broken_count: 0,
                        failures: vec![FailureDetail::new(FailureKind::Fail, "1 != 2")],
                    },
                ),
                entry("c", Outcome::crash("segfault")),
            ],
            &[],
        );

        assert_eq!(summary.verdict(), Verdict::Fail);
        assert_eq!(summary.skipped_count, 0);
        let statuses: Vec<_> = summary.nodes.iter().map(|node| node.status).collect();
        assert_eq!(
            statuses,
            [NodeStatus::Passed, NodeStatus::Failed, NodeStatus::Crashed]
        );
        assert_eq!(
            summary.totals(),
            NodeCounts {
                pass: 5,
                fail: 1,
                error: 1,
                broken: 1,
            }
        );
        assert_eq!(summary.nodes[2].results[0].description, "segfault");
        assert_eq!(
            summary.check(),
            Err(RunFailedError {
                failed: 1,
                crashed: 1,
                interrupted: 0,
                skipped: 0,
            })
        );
    }

    #[test]
    fn structured_failure_keeps_counts_and_failure_order() {
        let plan = SeedPlan {
            pool: vec![task("a", false)],
            node_pinned: Vec::new(),
        };
        let failures = vec![
            FailureDetail::new(FailureKind::Error, "undefined variable"),
            FailureDetail::new(FailureKind::Fail, "1 != 2"),
            FailureDetail::new(FailureKind::Fail, "x > y"),
        ];
        let summary = aggregate(
            &plan,
            vec![entry(
                "a",
                Outcome::StructuredFailure {
                    pass_count: 4,
                    broken_count: 2,
                    failures: failures.clone(),
                },
            )],
            &[],
        );

        let node = &summary.nodes[0];
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(
            node.counts,
            NodeCounts {
                pass: 4,
                fail: 2,
                error: 1,
                broken: 2,
            }
        );
        assert_eq!(node.results, failures);
    }

    #[test]
    fn structured_failure_without_failures_passes() {
        let plan = SeedPlan {
            pool: vec![task("a", false)],
            node_pinned: Vec::new(),
        };
        let summary = aggregate(
            &plan,
            vec![entry(
                "a",
                Outcome::StructuredFailure {
                    pass_count: 1,
                    broken_count: 2,
                    failures: Vec::new(),
                },
            )],
            &[],
        );
        assert_eq!(summary.verdict(), Verdict::Pass);
        assert_eq!(summary.check(), Ok(()));
    }

    #[test]
    fn report_order() {
        let plan = SeedPlan {
            pool: vec![task("p1", false), task("p2", false), task("p3", false)],
            node_pinned: vec![task("n1", true), task("n2", true)],
        };
        let summary = aggregate(
            &plan,
            vec![
                entry("n1", Outcome::crash("boom")),
                entry("p3", Outcome::crash("boom")),
                entry("p1", Outcome::crash("boom")),
            ],
            &[TestId::new("n2")],
        );
        assert_eq!(names(&summary), ["p3", "p1", "p2", "n1", "n2"]);
        assert_eq!(
            summary.nodes[2].status,
            NodeStatus::NotRun(NotRunCause::Interrupted)
        );
        assert_eq!(
            summary.nodes[4].status,
            NodeStatus::NotRun(NotRunCause::Skipped)
        );
        assert_eq!(summary.interrupted_count, 1);
        assert_eq!(summary.skipped_count, 1);
    }

    // Every planned test produces exactly one node, whatever subset completed and in whatever
    // order.
    #[proptest(cases = 64)]
    fn every_task_reported_once(
        #[strategy(1usize..40)] task_count: usize,
        #[strategy(proptest::collection::vec(any::<(bool, bool, bool)>(), #task_count))]
        flags: Vec<(bool, bool, bool)>,
        #[strategy(any::<u64>())] shuffle: u64,
    ) {
        let tasks: Vec<_> = flags
            .iter()
            .enumerate()
            .map(|(i, &(pinned, _, _))| task(&format!("t{i}"), pinned))
            .collect();
        let plan = SeedPlan {
            pool: tasks.iter().filter(|t| !t.is_node_pinned).cloned().collect(),
            node_pinned: tasks.iter().filter(|t| t.is_node_pinned).cloned().collect(),
        };

        let mut completed: Vec<_> = tasks
            .iter()
            .zip(&flags)
            .filter(|(_, (_, done, _))| *done)
            .map(|(t, _)| entry(t.id.as_str(), Outcome::crash("x")))
            .collect();
        let len = completed.len();
        if len > 1 {
            completed.rotate_left((shuffle as usize) % len);
        }
        let skipped: Vec<_> = tasks
            .iter()
            .zip(&flags)
            .filter(|(_, (_, done, skip))| !*done && *skip)
            .map(|(t, _)| t.id.clone())
            .collect();

        let summary = aggregate(&plan, completed, &skipped);
        prop_assert_eq!(summary.nodes.len(), task_count);
        let unique: HashSet<_> = summary.nodes.iter().map(|node| &node.name).collect();
        prop_assert_eq!(unique.len(), task_count);

        let not_run = summary
            .nodes
            .iter()
            .filter(|node| matches!(node.status, NodeStatus::NotRun(_)))
            .count();
        prop_assert_eq!(not_run, task_count - len);
        prop_assert_eq!(summary.skipped_count, skipped.len());

        // Node-pinned tests always come last.
        let first_pinned = summary
            .nodes
            .iter()
            .position(|node| plan.node_pinned.iter().any(|t| t.id == node.name))
            .unwrap_or(summary.nodes.len());
        prop_assert_eq!(first_pinned, plan.pool.len());
    }
}
