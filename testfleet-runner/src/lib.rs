// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for testfleet: fanning a list of long-running test files out across a pool
//! of worker processes, recycling workers that crash or grow too large, and merging every outcome
//! into a single report.
//!
//! The flow of a run is:
//!
//! 1. Load a [`FleetConfig`](config::FleetConfig) and pick a profile.
//! 2. Read a [`TestList`](list::TestList) from the test manifest.
//! 3. Build a [`TestRunner`](runner::TestRunner) with a
//!    [`WorkerSpawner`](worker::WorkerSpawner) for the pool and a
//!    [`LocalExecutor`](worker::LocalExecutor) for node-pinned tests.
//! 4. Execute it, feeding events to a [`DisplayReporter`](reporter::DisplayReporter), and check
//!    the resulting [`RunSummary`](reporter::RunSummary).

pub mod config;
pub mod errors;
mod helpers;
pub mod list;
pub mod queue;
pub mod reporter;
pub mod runner;
pub mod signal;
mod time;
pub mod worker;
