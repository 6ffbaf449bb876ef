// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Worker, WorkerLabel, WorkerSpawner};
use crate::errors::WorkerSpawnError;
use futures::future::{join_all, try_join_all};
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::debug;

/// The lifecycle state of a [`WorkerHandle`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WorkerState {
    /// Waiting for a test.
    Idle,

    /// Running a test.
    Busy,

    /// Terminated, abandoned, or failed to start.
    Dead,
}

/// The pool's record of one worker slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkerHandle {
    /// The slot's index in the pool.
    pub id: usize,

    /// The slot's current state.
    pub state: WorkerState,

    /// Incremented every time the slot's process is replaced.
    pub generation: u64,
}

impl WorkerHandle {
    /// Returns the label of the process currently in this slot.
    pub fn label(&self) -> WorkerLabel {
        WorkerLabel {
            id: self.id,
            generation: self.generation,
        }
    }
}

/// Manages a bounded set of worker slots.
///
/// The pool owns the registry of [`WorkerHandle`]s; the workers themselves are owned by whoever is
/// driving them, and are handed back to the pool to be replaced or shut down.
#[derive(Debug)]
pub struct WorkerPool<S> {
    spawner: S,
    registry: Mutex<Vec<WorkerHandle>>,
    shutdown_grace: Duration,
}

impl<S: WorkerSpawner> WorkerPool<S> {
    /// Creates a new, empty pool. Workers get `shutdown_grace` to exit before being killed.
    pub fn new(spawner: S, shutdown_grace: Duration) -> Self {
        Self {
            spawner,
            registry: Mutex::new(Vec::new()),
            shutdown_grace,
        }
    }

    /// Starts `n` new workers concurrently, in new slots.
    ///
    /// If any worker fails to start, the ones that did start are dropped, which kills them.
    pub async fn spawn(&self, n: usize) -> Result<Vec<(WorkerLabel, S::Worker)>, WorkerSpawnError> {
        let labels: Vec<_> = {
            let mut registry = self.lock();
            let start = registry.len();
            (start..start + n)
                .map(|id| {
                    registry.push(WorkerHandle {
                        id,
                        state: WorkerState::Dead,
                        generation: 0,
                    });
                    WorkerLabel::new(id)
                })
                .collect()
        };

        let workers = try_join_all(labels.iter().map(|&label| self.spawner.spawn(label))).await?;
        for &label in &labels {
            self.set_state(label, WorkerState::Idle);
        }
        debug!("spawned {n} workers");

        Ok(labels.into_iter().zip(workers).collect())
    }

    /// Terminates `old` and starts a fresh worker in the same slot, one generation later.
    ///
    /// The slot's generation is bumped before the new worker starts, so it's never current for
    /// more than one process. If the new worker fails to start, the slot stays dead.
    pub async fn replace(
        &self,
        label: WorkerLabel,
        old: S::Worker,
    ) -> Result<(WorkerLabel, S::Worker), WorkerSpawnError> {
        self.set_state(label, WorkerState::Dead);
        old.terminate(self.shutdown_grace).await;

        let next = label.next_generation();
        {
            let mut registry = self.lock();
            if let Some(handle) = registry.get_mut(label.id) {
                handle.generation = next.generation;
                handle.state = WorkerState::Dead;
            }
        }

        let worker = self.spawner.spawn(next).await?;
        self.set_state(next, WorkerState::Idle);
        debug!("replaced worker {label} with {next}");
        Ok((next, worker))
    }

    /// Updates the state of a slot, if `label` is still its current generation.
    pub fn set_state(&self, label: WorkerLabel, state: WorkerState) {
        let mut registry = self.lock();
        if let Some(handle) = registry.get_mut(label.id)
            && handle.generation == label.generation
        {
            handle.state = state;
        }
    }

    /// Returns true if `label` names the process currently in its slot.
    pub fn is_current(&self, label: WorkerLabel) -> bool {
        self.lock()
            .get(label.id)
            .is_some_and(|handle| handle.generation == label.generation)
    }

    /// Returns a snapshot of all slots.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.lock().clone()
    }

    /// Shuts down the given workers concurrently and marks every slot dead.
    pub async fn shutdown_all(&self, workers: Vec<(WorkerLabel, S::Worker)>) {
        let count = workers.len();
        join_all(
            workers
                .into_iter()
                .map(|(_, worker)| worker.terminate(self.shutdown_grace)),
        )
        .await;

        for handle in self.lock().iter_mut() {
            handle.state = WorkerState::Dead;
        }
        debug!("shut down {count} workers");
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WorkerHandle>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
