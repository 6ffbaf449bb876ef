// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for testfleet.
//!
//! Settings are layered: the embedded default config, then the repository's
//! `.config/testfleet.toml` (or an explicit file), then command-line overrides applied by the
//! [`TestRunnerBuilder`](crate::runner::TestRunnerBuilder).

mod elements;
mod imp;

pub use elements::*;
pub use imp::*;
