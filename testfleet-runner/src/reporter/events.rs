// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::ResultEntry;
use crate::{
    config::MaxRss,
    runner::{CancelReason, RecycleReason},
    time::StopwatchStart,
    worker::WorkerLabel,
};
use chrono::{DateTime, FixedOffset, Local};
use std::{sync::Arc, time::Duration};
use testfleet_metadata::{Seed, TestId};

/// A test event.
///
/// Events are produced by a [`TestRunner`](crate::runner::TestRunner) and consumed by a
/// [`DisplayReporter`](crate::reporter::DisplayReporter).
#[derive(Clone, Debug)]
pub struct TestEvent {
    /// The time at which the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the start of the test run.
    pub elapsed: Duration,

    /// The kind of test event this is.
    pub kind: TestEventKind,
}

impl TestEvent {
    pub(crate) fn new(stopwatch: &StopwatchStart, kind: TestEventKind) -> Self {
        Self {
            timestamp: Local::now().fixed_offset(),
            elapsed: stopwatch.elapsed(),
            kind,
        }
    }
}

/// The kind of test event this is.
///
/// Forms part of [`TestEvent`].
#[derive(Clone, Debug)]
pub enum TestEventKind {
    /// The test run started.
    RunStarted {
        /// The number of workers in the pool.
        pool_size: usize,

        /// The number of tests dispatched to the pool.
        pool_test_count: usize,

        /// The number of node-pinned tests, run after the pool drains.
        node_pinned_count: usize,

        /// The RNG seed handed to every test.
        seed: Seed,

        /// The memory limit for workers.
        max_rss: MaxRss,
    },

    /// A test started running.
    TestStarted {
        /// The test.
        test_id: TestId,

        /// The worker running it, or `None` for the controller.
        worker: Option<WorkerLabel>,
    },

    /// A test finished running.
    TestFinished {
        /// The recorded result.
        entry: ResultEntry,

        /// Whether to print failure details along with the status line.
        show_detail: bool,

        /// The number of tests completed so far, including this one.
        completed: usize,

        /// The total number of tests in the run.
        total: usize,
    },

    /// A worker was replaced with a fresh process.
    WorkerRecycled {
        /// The worker that was terminated.
        old: WorkerLabel,

        /// Its replacement.
        new: WorkerLabel,

        /// Why the worker was replaced.
        reason: RecycleReason,
    },

    /// A replacement worker couldn't be started. Tests that would have gone to it are left for
    /// other workers.
    WorkerReplaceFailed {
        /// The worker that was terminated.
        old: WorkerLabel,

        /// The error, with its sources.
        error: Arc<str>,
    },

    /// A crash stopped intake: pending tests were discarded.
    IntakeHalted {
        /// The test whose crash triggered the halt.
        test_id: TestId,

        /// The number of tests discarded.
        skipped: usize,
    },

    /// Cancellation was requested.
    RunBeginCancel {
        /// Why the run is being cancelled.
        reason: CancelReason,

        /// The number of dispatchers still running.
        running: usize,
    },

    /// Dispatchers didn't stop within the grace period and were aborted.
    DispatchersAborted {
        /// The number of dispatchers aborted.
        count: usize,
    },

    /// The pool drained and node-pinned tests are about to run.
    NodeOnlyStarted {
        /// The number of node-pinned tests.
        count: usize,
    },
}
