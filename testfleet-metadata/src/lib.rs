// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable types shared between the testfleet controller, its worker processes, and the
//! test files they run.
//!
//! The controller and each worker exchange [`WorkRequest`] and [`WorkResponse`] messages as
//! newline-delimited JSON. A test file reports structured bookkeeping by writing a
//! [`TestResultFile`] to the path named by [`RESULT_PATH_ENV`].

mod errors;
mod exit_codes;
mod ids;
mod protocol;
mod result_file;

pub use errors::*;
pub use exit_codes::*;
pub use ids::*;
pub use protocol::*;
pub use result_file::*;
