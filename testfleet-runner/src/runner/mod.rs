// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`]. A run goes through two phases: a pool
//! phase, where one dispatcher per worker drains the [`WorkQueue`](crate::queue::WorkQueue), and a
//! node-only phase, where node-pinned tests run one at a time in the controller. Between tests, a
//! [`RecyclePolicy`] decides whether the worker that ran the test is kept, replaced, or stops the
//! run.

mod dispatcher;
mod governor;
mod imp;
mod interrupt;
mod node_only;

pub use governor::*;
pub use imp::*;
pub use interrupt::*;
