// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The queue of tests waiting for a worker.

use crate::list::TestTask;
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// A thread-safe FIFO of pending tests.
///
/// Every task returned by [`take`](Self::take) is returned exactly once, across all callers. A
/// task is either taken or handed back by [`drain`](Self::drain), never both.
#[derive(Debug, Default)]
pub struct WorkQueue {
    pending: Mutex<VecDeque<TestTask>>,
}

impl WorkQueue {
    /// Creates a new, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends tasks to the back of the queue, in order.
    pub fn seed(&self, tasks: impl IntoIterator<Item = TestTask>) {
        self.lock().extend(tasks);
    }

    /// Takes the task at the front of the queue, if any.
    pub fn take(&self) -> Option<TestTask> {
        self.lock().pop_front()
    }

    /// Returns the number of tasks that haven't been taken yet.
    pub fn remaining_count(&self) -> usize {
        self.lock().len()
    }

    /// Removes every pending task, returning them in queue order.
    pub fn drain(&self) -> Vec<TestTask> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TestTask>> {
        // The critical sections above can't panic partway through, so the data is consistent even
        // if another thread panicked while holding the lock.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
