// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `testfleet` failures.
///
/// `testfleet run` may fail for a variety of reasons. This structure documents the exit codes that
/// may occur in case of expected failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum FleetExitCode {}

impl FleetExitCode {
    /// No errors occurred and every test passed.
    pub const OK: i32 = 0;

    /// One or more tests failed, crashed, or were interrupted.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// A test exceeded the configured memory limit while running on the only worker.
    pub const MEMORY_LIMIT_EXCEEDED: i32 = 107;

    /// A worker process could not be started.
    pub const WORKER_SPAWN_FAILED: i32 = 108;

    /// Writing data to stdout, stderr or a report file produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;

    /// A worker process received a malformed request or could not reply.
    ///
    /// Only produced by `testfleet __worker`.
    pub const WORKER_PROTOCOL_ERROR: i32 = 71;

    /// A user issue happened while setting up a testfleet invocation.
    pub const SETUP_ERROR: i32 = 96;
}
