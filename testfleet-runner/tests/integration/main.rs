// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scheduling tests that drive a whole run against in-process fake workers.

mod fixtures;

use color_eyre::eyre::{Result, bail};
use fixtures::*;
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use test_strategy::proptest;
use testfleet_metadata::TestId;
use testfleet_runner::{
    errors::{RunFailedError, TestRunnerExecuteError},
    reporter::{NodeStatus, NotRunCause, RunSummary, TestEventKind, Verdict},
    worker::{Isolation, WorkerLabel},
};

fn status_of(summary: &RunSummary, id: &str) -> NodeStatus {
    summary
        .nodes
        .iter()
        .find(|node| node.name.as_str() == id)
        .unwrap_or_else(|| panic!("no node for `{id}`"))
        .status
}

const SINGLE_WORKER: &str = indoc! {r#"
    [profile.default]
    workers = 1
    force-multiprocess = true
"#};

#[test]
fn mixed_outcomes_fail_without_skips() -> Result<()> {
    let (_dir, config) = workspace(indoc! {r#"
        [profile.default]
        workers = 3
        force-multiprocess = true
    "#})?;
    let fleet = FakeFleet::new([("a", Script::Pass), ("b", Script::Fail), ("c", Script::Crash)]);
    let output = run(&config, vec![task("a"), task("b"), task("c")], &fleet, never)?;
    let summary = output.result?;

    assert_eq!(summary.verdict(), Verdict::Fail);
    assert_eq!(summary.skipped_count, 0);
    assert_eq!(status_of(&summary, "a"), NodeStatus::Passed);
    assert_eq!(status_of(&summary, "b"), NodeStatus::Failed);
    assert_eq!(status_of(&summary, "c"), NodeStatus::Crashed);
    assert_eq!(
        summary.check(),
        Err(RunFailedError {
            failed: 1,
            crashed: 1,
            interrupted: 0,
            skipped: 0,
        })
    );

    // The crash recycled its worker; the structured failure didn't.
    let recycled: Vec<_> = output
        .events
        .iter()
        .filter_map(|kind| match kind {
            TestEventKind::WorkerRecycled { old, new, .. } => Some((*old, *new)),
            _ => None,
        })
        .collect();
    assert_eq!(recycled.len(), 1, "exactly one recycle: {recycled:?}");
    let (old, new) = recycled[0];
    assert_eq!(new, old.next_generation());
    assert_eq!(fleet.spawned().len(), 4);
    Ok(())
}

#[test]
fn exit_on_first_error_skips_pending_tests() -> Result<()> {
    let (_dir, config) = workspace(indoc! {r#"
        [profile.default]
        workers = 1
        force-multiprocess = true
        exit-on-first-error = true
    "#})?;
    let fleet = FakeFleet::new([("a", Script::Crash)]);
    let output = run(&config, vec![task("a"), task("b"), task("c")], &fleet, never)?;
    let summary = output.result?;

    assert_eq!(fleet.executed_ids(), ["a"]);
    assert_eq!(summary.skipped_count, 2);
    assert_eq!(status_of(&summary, "a"), NodeStatus::Crashed);
    assert_eq!(
        status_of(&summary, "b"),
        NodeStatus::NotRun(NotRunCause::Skipped)
    );
    assert_eq!(
        status_of(&summary, "c"),
        NodeStatus::NotRun(NotRunCause::Skipped)
    );
    assert_eq!(summary.verdict(), Verdict::Fail);

    // Crash detail is held back, and the halt is announced once.
    let show_detail = output.events.iter().find_map(|kind| match kind {
        TestEventKind::TestFinished {
            entry, show_detail, ..
        } if entry.test_id.as_str() == "a" => Some(*show_detail),
        _ => None,
    });
    assert_eq!(show_detail, Some(false));
    let halts: Vec<_> = output
        .events
        .iter()
        .filter_map(|kind| match kind {
            TestEventKind::IntakeHalted { test_id, skipped } => Some((test_id.clone(), *skipped)),
            _ => None,
        })
        .collect();
    assert_eq!(halts, [(TestId::new("a"), 2)]);
    Ok(())
}

#[test]
fn sole_worker_crash_reuses_worker_by_default() -> Result<()> {
    let (_dir, config) = workspace(SINGLE_WORKER)?;
    let fleet = FakeFleet::new([("a", Script::Crash)]);
    let output = run(&config, vec![task("a"), task("b")], &fleet, never)?;
    let summary = output.result?;

    assert_eq!(fleet.spawned(), [WorkerLabel::new(0)]);
    let workers: Vec<_> = fleet
        .executions()
        .into_iter()
        .map(|execution| execution.worker)
        .collect();
    assert_eq!(workers, [Some(WorkerLabel::new(0)), Some(WorkerLabel::new(0))]);
    assert_eq!(status_of(&summary, "b"), NodeStatus::Passed);
    Ok(())
}

#[test]
fn sole_worker_crash_halt() -> Result<()> {
    let (_dir, config) = workspace(indoc! {r#"
        [profile.default]
        workers = 1
        force-multiprocess = true
        sole-worker-crash = "halt"
    "#})?;
    let fleet = FakeFleet::new([("a", Script::Crash)]);
    let output = run(
        &config,
        vec![task("a"), task("b"), pinned("n")],
        &fleet,
        never,
    )?;
    let summary = output.result?;

    // Halting drains the queue. The node-pinned test was never queued and still runs.
    assert_eq!(fleet.executed_ids(), ["a", "n"]);
    assert_eq!(summary.skipped_count, 1);
    assert_eq!(
        status_of(&summary, "b"),
        NodeStatus::NotRun(NotRunCause::Skipped)
    );
    assert_eq!(status_of(&summary, "n"), NodeStatus::Passed);
    Ok(())
}

#[test]
fn exit_on_first_error_still_runs_node_pinned_tests() -> Result<()> {
    let (_dir, config) = workspace(indoc! {r#"
        [profile.default]
        workers = 1
        force-multiprocess = true
        exit-on-first-error = true
    "#})?;
    let fleet = FakeFleet::new([("a", Script::Crash)]);
    let output = run(
        &config,
        vec![task("a"), task("b"), task("c"), pinned("n")],
        &fleet,
        never,
    )?;
    let summary = output.result?;

    assert_eq!(fleet.executed_ids(), ["a", "n"]);
    assert_eq!(summary.skipped_count, 2);
    assert_eq!(status_of(&summary, "n"), NodeStatus::Passed);
    assert_eq!(
        summary.check(),
        Err(RunFailedError {
            failed: 0,
            crashed: 1,
            interrupted: 0,
            skipped: 2,
        })
    );
    let halted: Vec<_> = output
        .events
        .iter()
        .filter_map(|kind| match kind {
            TestEventKind::IntakeHalted { skipped, .. } => Some(*skipped),
            _ => None,
        })
        .collect();
    assert_eq!(halted, [2]);
    Ok(())
}

#[test]
fn lost_sole_worker_is_respawned() -> Result<()> {
    let (_dir, config) = workspace(SINGLE_WORKER)?;
    let fleet = FakeFleet::new([("a", Script::LoseWorker)]);
    let output = run(&config, vec![task("a"), task("b")], &fleet, never)?;
    let summary = output.result?;

    assert_eq!(
        fleet.spawned(),
        [WorkerLabel::new(0), WorkerLabel::new(0).next_generation()]
    );
    let crashed = summary
        .nodes
        .iter()
        .find(|node| node.name.as_str() == "a")
        .expect("node for a");
    assert_eq!(crashed.status, NodeStatus::Crashed);
    assert!(
        crashed.results[0]
            .description
            .contains("worker exited unexpectedly"),
        "crash info names the worker error: {:?}",
        crashed.results[0]
    );
    assert_eq!(status_of(&summary, "b"), NodeStatus::Passed);
    Ok(())
}

#[test]
fn interrupt_marks_untaken_tests_interrupted() -> Result<()> {
    let (_dir, config) = workspace(SINGLE_WORKER)?;
    let fleet = FakeFleet::new([("b", Script::Hang)]);
    let output = run(
        &config,
        vec![task("a"), task("b"), task("c")],
        &fleet,
        |kind| matches!(kind, TestEventKind::TestStarted { test_id, .. } if test_id.as_str() == "b"),
    )?;
    let summary = output.result?;

    // `b` may be abandoned before its execution starts, but `c` is never taken.
    let executed = fleet.executed_ids();
    assert_eq!(executed[0], "a");
    assert!(
        !executed.iter().any(|id| id == "c"),
        "c was dispatched: {executed:?}"
    );
    assert_eq!(status_of(&summary, "a"), NodeStatus::Passed);
    assert_eq!(
        status_of(&summary, "b"),
        NodeStatus::NotRun(NotRunCause::Interrupted)
    );
    assert_eq!(
        status_of(&summary, "c"),
        NodeStatus::NotRun(NotRunCause::Interrupted)
    );
    assert_eq!(summary.interrupted_count, 2);
    assert_eq!(summary.skipped_count, 0);
    assert_eq!(
        summary.check(),
        Err(RunFailedError {
            failed: 0,
            crashed: 0,
            interrupted: 2,
            skipped: 0,
        })
    );

    // The abandoned worker is still shut down.
    assert_eq!(fleet.terminated(), [WorkerLabel::new(0)]);
    assert!(
        output
            .events
            .iter()
            .any(|kind| matches!(kind, TestEventKind::RunBeginCancel { .. })),
        "cancellation was announced"
    );
    Ok(())
}

#[test]
fn memory_breach_with_pool_recycles_worker() -> Result<()> {
    let (_dir, config) = workspace(indoc! {r#"
        [profile.default]
        workers = 2
        force-multiprocess = true
        max-rss = "1 MiB"
    "#})?;
    let fleet = FakeFleet::new([("a", Script::Rss(2 * 1024 * 1024))]);
    let tasks = ["a", "b", "c", "d", "e"].map(task).to_vec();
    let output = run(&config, tasks, &fleet, never)?;
    let summary = output.result?;

    // A breach isn't a failure.
    assert_eq!(summary.verdict(), Verdict::Pass);

    let executions = fleet.executions();
    let breach_index = executions
        .iter()
        .position(|execution| execution.test_id.as_str() == "a")
        .expect("a was executed");
    let Some(stale) = executions[breach_index].worker else {
        bail!("a ran in the controller");
    };
    assert!(
        fleet.spawned().contains(&stale.next_generation()),
        "worker {stale} was replaced"
    );
    assert!(
        executions[breach_index + 1..]
            .iter()
            .all(|execution| execution.worker != Some(stale)),
        "no test was dispatched to the stale generation: {executions:?}"
    );
    assert!(fleet.terminated().contains(&stale));
    Ok(())
}

#[test]
fn memory_breach_on_sole_worker_aborts() -> Result<()> {
    let (_dir, config) = workspace(indoc! {r#"
        [profile.default]
        workers = 1
        force-multiprocess = true
        max-rss = "1 MiB"
    "#})?;
    let fleet = FakeFleet::new([("b", Script::Rss(2 * 1024 * 1024))]);
    let output = run(
        &config,
        vec![task("a"), task("b"), task("c"), pinned("n")],
        &fleet,
        never,
    )?;

    match output.result {
        Err(TestRunnerExecuteError::MemoryLimitExceeded { test_id, .. }) => {
            assert_eq!(test_id.as_str(), "b");
        }
        other => bail!("expected a memory limit error, got {other:?}"),
    }
    // Queued and node-pinned tests never reach a worker.
    assert_eq!(fleet.executed_ids(), ["a", "b"]);
    Ok(())
}

#[test]
fn node_pinned_tests_run_after_pool() -> Result<()> {
    let (_dir, config) = workspace(indoc! {r#"
        [profile.default]
        workers = 2
        force-multiprocess = true
        shared-state-test = "shared"
    "#})?;
    let fleet = FakeFleet::new([]);
    let tasks = vec![
        pinned("shared"),
        task("a"),
        pinned("isolated"),
        task("b"),
        task("c"),
    ];
    let output = run(&config, tasks, &fleet, never)?;
    let summary = output.result?;

    let names: Vec<_> = summary
        .nodes
        .iter()
        .map(|node| node.name.as_str())
        .collect();
    assert_eq!(&names[3..], ["shared", "isolated"]);
    let pool: HashSet<_> = names[..3].iter().copied().collect();
    assert_eq!(pool, HashSet::from(["a", "b", "c"]));

    // Every pool execution happens before the first controller execution.
    let executions = fleet.executions();
    let first_local = executions
        .iter()
        .position(|execution| execution.worker.is_none())
        .expect("node-pinned tests ran");
    assert_eq!(first_local, 3);
    let local: Vec<_> = executions[3..]
        .iter()
        .map(|execution| (execution.test_id.as_str(), execution.isolation))
        .collect();
    assert_eq!(
        local,
        [
            ("shared", Some(Isolation::Inherit)),
            ("isolated", Some(Isolation::Sandboxed)),
        ]
    );
    assert!(
        output
            .events
            .iter()
            .any(|kind| matches!(kind, TestEventKind::NodeOnlyStarted { count: 2 })),
    );
    assert_eq!(summary.verdict(), Verdict::Pass);
    Ok(())
}

#[test]
fn front_load_runs_first() -> Result<()> {
    let (_dir, config) = workspace(indoc! {r#"
        [profile.default]
        workers = 1
        force-multiprocess = true
        front-load = ["slow"]
    "#})?;
    let fleet = FakeFleet::new([]);
    let output = run(
        &config,
        vec![task("a"), task("b"), task("slow")],
        &fleet,
        never,
    )?;
    output.result?;

    assert_eq!(fleet.executed_ids(), ["slow", "a", "b"]);
    Ok(())
}

#[proptest(cases = 32)]
fn every_test_is_completed_or_interrupted(
    #[strategy(proptest::collection::vec(0u8..3, 1..12))] scripts: Vec<u8>,
    #[strategy(1usize..4)] workers: usize,
    #[strategy(0usize..12)] cancel_after: usize,
) {
    let contents = format!(
        "[profile.default]\nworkers = {workers}\nforce-multiprocess = true\n"
    );
    let (_dir, config) = workspace(&contents).unwrap();
    let ids: Vec<String> = (0..scripts.len()).map(|i| format!("t{i}")).collect();
    let fleet = FakeFleet::new(ids.iter().zip(&scripts).map(|(id, script)| {
        let script = match script {
            0 => Script::Pass,
            1 => Script::Fail,
            _ => Script::Crash,
        };
        (id.as_str(), script)
    }));

    let mut finished = 0;
    let output = run(
        &config,
        ids.iter().map(|id| task(id)).collect(),
        &fleet,
        move |kind| {
            if matches!(kind, TestEventKind::TestFinished { .. }) {
                finished += 1;
                finished == cancel_after
            } else {
                false
            }
        },
    )
    .unwrap();
    let summary = output.result.unwrap();

    let mut completed = HashSet::new();
    let mut interrupted = HashSet::new();
    for node in &summary.nodes {
        // Nothing is skipped without a halt.
        proptest::prop_assert_ne!(node.status, NodeStatus::NotRun(NotRunCause::Skipped));
        let inserted = if node.status == NodeStatus::NotRun(NotRunCause::Interrupted) {
            interrupted.insert(node.name.clone())
        } else {
            completed.insert(node.name.clone())
        };
        proptest::prop_assert!(inserted, "`{}` reported twice", node.name);
    }
    proptest::prop_assert!(completed.is_disjoint(&interrupted));
    let all: HashSet<_> = ids.iter().map(TestId::new).collect();
    let union: HashSet<_> = completed.union(&interrupted).cloned().collect();
    proptest::prop_assert_eq!(union, all);
    proptest::prop_assert_eq!(summary.interrupted_count, interrupted.len());
}
