// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::worker::WorkerLabel;
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use testfleet_metadata::{Outcome, ResourceUsage, TestId};

/// The recorded result of one test.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultEntry {
    /// The test that ran.
    pub test_id: TestId,

    /// How it ended.
    pub outcome: Outcome,

    /// How long it took, as measured by whoever ran it.
    pub duration: Duration,

    /// Resources reported for the test.
    pub resources: ResourceUsage,

    /// The worker that ran the test, or `None` if it ran in the controller.
    pub worker: Option<WorkerLabel>,
}

/// Append-only record of completed and skipped tests, in completion order.
#[derive(Debug, Default)]
pub struct ResultLog {
    inner: Mutex<ResultLogInner>,
}

#[derive(Debug, Default)]
struct ResultLogInner {
    entries: Vec<ResultEntry>,
    skipped: Vec<TestId>,
}

impl ResultLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a completed test.
    pub fn push(&self, entry: ResultEntry) {
        self.lock().entries.push(entry);
    }

    /// Records tests that were discarded without running.
    pub fn record_skipped(&self, ids: impl IntoIterator<Item = TestId>) {
        self.lock().skipped.extend(ids);
    }

    /// Returns the number of completed tests.
    pub fn completed_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns a copy of the completed tests, in completion order.
    pub fn entries(&self) -> Vec<ResultEntry> {
        self.lock().entries.clone()
    }

    /// Returns a copy of the skipped test IDs.
    pub fn skipped(&self) -> Vec<TestId> {
        self.lock().skipped.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ResultLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
