// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages exchanged between the controller and a worker process.
//!
//! Each message is one JSON object terminated by a newline.

use crate::{ProtocolDecodeError, Seed, TestId};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A request sent from the controller to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkRequest {
    /// Run a single test file.
    Execute(ExecuteRequest),

    /// Shut down gracefully.
    Exit,
}

/// The payload of [`WorkRequest::Execute`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecuteRequest {
    /// The test to run.
    pub test_id: TestId,

    /// The test file handed to the interpreter.
    pub path: Utf8PathBuf,

    /// The seed for the run.
    pub seed: Seed,

    /// The generation of the worker handle this request was sent to. Echoed back in the response.
    pub generation: u64,
}

/// A response sent from a worker to the controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkResponse {
    /// The worker has started and is ready to accept requests.
    Ready {
        /// The worker's process ID.
        pid: u32,
    },

    /// A test finished running.
    Completed(ExecuteResponse),
}

/// The payload of [`WorkResponse::Completed`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecuteResponse {
    /// The test that was run.
    pub test_id: TestId,

    /// The generation from the corresponding request.
    pub generation: u64,

    /// How the test ended.
    pub outcome: Outcome,

    /// Wall-clock time spent running the test.
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Resources consumed while running the test.
    pub resources: ResourceUsage,
}

/// How a single test ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum Outcome {
    /// The test passed.
    Pass {
        /// Counts reported by the test.
        summary: TestSummary,
    },

    /// The test ran to completion and reported one or more failures through its structured
    /// bookkeeping.
    StructuredFailure {
        /// The number of passing checks.
        pass_count: u64,
        /// The number of checks marked as broken (known failures).
        broken_count: u64,
        /// Failures, in the order they were recorded.
        failures: Vec<FailureDetail>,
    },

    /// The test did not produce structured results: it crashed, was killed, or the worker failed
    /// to run it.
    OpaqueCrash {
        /// A human-readable description of what went wrong.
        info: String,
    },
}

impl Outcome {
    /// Creates an `OpaqueCrash` outcome.
    pub fn crash(info: impl Into<String>) -> Self {
        Self::OpaqueCrash { info: info.into() }
    }

    /// Returns true if this outcome is fully passing.
    pub fn is_passing(&self) -> bool {
        match self {
            Self::Pass { .. } => true,
            Self::StructuredFailure { failures, .. } => failures.is_empty(),
            Self::OpaqueCrash { .. } => false,
        }
    }

    /// Returns true if this is an opaque crash.
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::OpaqueCrash { .. })
    }
}

/// Counts reported by a passing test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestSummary {
    /// The number of passing checks.
    pub pass_count: u64,

    /// The number of checks marked as broken (known failures).
    pub broken_count: u64,
}

/// One failure recorded by a test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailureDetail {
    /// Whether this was a failed check or an unexpected error.
    pub kind: FailureKind,

    /// What went wrong.
    pub description: String,

    /// Where it went wrong, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl FailureDetail {
    /// Creates a new `FailureDetail` without a location.
    pub fn new(kind: FailureKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            location: None,
        }
    }
}

/// The kind of a [`FailureDetail`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// A check evaluated to false.
    Fail,

    /// A check raised an unexpected error.
    Error,
}

/// Resources consumed while running a test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceUsage {
    /// Peak resident set size of the worker, in bytes.
    pub peak_rss: u64,

    /// Time spent in garbage collection, as reported by the test.
    #[serde(with = "duration_secs")]
    pub gc_time: Duration,

    /// Bytes allocated, as reported by the test.
    pub bytes_allocated: u64,
}

impl WorkRequest {
    /// Serializes this request to a JSON line, including the trailing newline.
    pub fn to_line(&self) -> String {
        to_line(self)
    }

    /// Deserializes a request from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, ProtocolDecodeError> {
        serde_json::from_str(line.trim()).map_err(|err| ProtocolDecodeError::new(line, err))
    }
}

impl WorkResponse {
    /// Serializes this response to a JSON line, including the trailing newline.
    pub fn to_line(&self) -> String {
        to_line(self)
    }

    /// Deserializes a response from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, ProtocolDecodeError> {
        serde_json::from_str(line.trim()).map_err(|err| ProtocolDecodeError::new(line, err))
    }
}

fn to_line<T: Serialize>(value: &T) -> String {
    // Protocol messages only contain strings, integers and finite floats, so serialization can't
    // fail.
    let mut json = serde_json::to_string(value).expect("protocol message serialization failed");
    json.push('\n');
    json
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
