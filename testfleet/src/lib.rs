// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs a suite of test files across a pool of worker processes.
//!
//! `testfleet run` reads a test manifest, starts workers by re-executing itself as
//! `testfleet __worker`, and reports each result as it arrives. Exit codes are documented in
//! [`FleetExitCode`](testfleet_metadata::FleetExitCode).

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::OutputWriter;
