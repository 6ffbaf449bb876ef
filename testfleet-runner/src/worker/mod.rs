// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker processes and the pool that owns them.
//!
//! The controller talks to a worker through the [`Worker`] trait: one [`ExecuteRequest`] in, one
//! [`ExecuteResponse`] out. [`ProcessWorker`] is the production implementation, which re-executes
//! the current binary in worker mode and exchanges JSON lines over its standard streams; inside
//! that process, [`serve`] loops over requests and runs each one with a [`TestExecutor`].

mod executor;
mod pool;
mod process;
mod serve;

pub use executor::*;
pub use pool::*;
pub use process::*;
pub use serve::*;

use crate::errors::{WorkerError, WorkerSpawnError};
use std::{fmt, future::Future, time::Duration};
use testfleet_metadata::{ExecuteRequest, ExecuteResponse};

/// Identifies a worker handle together with the generation of the process currently behind it.
///
/// Replacing a worker keeps its `id` and bumps its `generation`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct WorkerLabel {
    /// The handle's slot in the pool.
    pub id: usize,

    /// The number of times the slot has been recycled.
    pub generation: u64,
}

impl WorkerLabel {
    /// Creates a label for the first process in a slot.
    pub fn new(id: usize) -> Self {
        Self { id, generation: 0 }
    }

    /// Returns the label for the process that replaces this one.
    pub fn next_generation(self) -> Self {
        Self {
            id: self.id,
            generation: self.generation + 1,
        }
    }
}

impl fmt::Display for WorkerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation == 0 {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}.{}", self.id, self.generation)
        }
    }
}

/// A handle to one worker that can run tests for the controller.
pub trait Worker: Send + 'static {
    /// Runs a test and waits for its result.
    ///
    /// If the returned future is dropped before completing, the worker is in an unknown state and
    /// must be terminated.
    fn execute(
        &mut self,
        request: ExecuteRequest,
    ) -> impl Future<Output = Result<ExecuteResponse, WorkerError>> + Send;

    /// Shuts the worker down, forcibly if it doesn't exit within `grace`.
    fn terminate(self, grace: Duration) -> impl Future<Output = ()> + Send;
}

/// Starts new workers for a [`WorkerPool`].
///
/// Every worker a spawner starts gets the same startup environment.
pub trait WorkerSpawner: Send + Sync + 'static {
    /// The type of worker produced.
    type Worker: Worker;

    /// Starts a worker and waits until it's ready to accept requests.
    fn spawn(
        &self,
        label: WorkerLabel,
    ) -> impl Future<Output = Result<Self::Worker, WorkerSpawnError>> + Send;
}

/// Runs tests inside the controller process. Used for node-pinned tests.
pub trait LocalExecutor: Send + Sync + 'static {
    /// Runs a test to completion. Failures to run the test are reported as crash outcomes.
    fn execute_local(
        &self,
        request: ExecuteRequest,
        isolation: Isolation,
    ) -> impl Future<Output = ExecuteResponse> + Send;
}
