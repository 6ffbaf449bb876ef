// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The list of tests to run, and the policy that orders them.

mod test_list;

pub use test_list::*;
