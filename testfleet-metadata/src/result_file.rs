// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::FailureDetail;
use serde::{Deserialize, Serialize};

/// The environment variable holding the path a test writes its [`TestResultFile`] to.
pub const RESULT_PATH_ENV: &str = "TESTFLEET_RESULT_PATH";

/// The environment variable holding the run's [`Seed`](crate::Seed), in hexadecimal.
pub const SEED_ENV: &str = "TESTFLEET_SEED";

/// The environment variable holding the [`TestId`](crate::TestId) being run.
pub const TEST_ID_ENV: &str = "TESTFLEET_TEST_ID";

/// Structured bookkeeping written by a test file.
///
/// A test that doesn't write this file is judged by its exit status alone.
///
/// ```json
/// {"pass": 10, "broken": 1, "failures": [{"kind": "fail", "description": "x == 2"}]}
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestResultFile {
    /// The number of passing checks.
    #[serde(default)]
    pub pass: u64,

    /// The number of checks marked as broken.
    #[serde(default)]
    pub broken: u64,

    /// Recorded failures, in order.
    #[serde(default)]
    pub failures: Vec<FailureDetail>,

    /// Time spent in garbage collection, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc_time_secs: Option<f64>,

    /// Bytes allocated by the test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_allocated: Option<u64>,
}
