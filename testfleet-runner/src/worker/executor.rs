// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::LocalExecutor;
use crate::{
    errors::{DisplayErrorChain, TestExecSetupError},
    helpers::{display_exited_with, output_tail},
    time::stopwatch,
};
use camino::Utf8PathBuf;
use std::{process::Stdio, time::Duration};
use testfleet_metadata::{
    ExecuteRequest, ExecuteResponse, FailureDetail, FailureKind, Outcome, RESULT_PATH_ENV,
    ResourceUsage, SEED_ENV, TEST_ID_ENV, TestResultFile, TestSummary,
};
use tokio::process::Command;
use tracing::debug;

/// Environment variables passed through to isolated tests.
pub const ISOLATION_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "TMPDIR", "LANG"];

// Crash reports carry at most this much of the test's standard error.
const STDERR_TAIL_LEN: usize = 4096;

/// The environment a test process runs in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Isolation {
    /// The caller's working directory and full environment.
    Inherit,

    /// A fresh scratch directory, and an environment cleared down to
    /// [`ISOLATION_ENV_ALLOWLIST`] plus the run variables.
    Sandboxed,
}

/// Runs a single test file as a child process and classifies the result.
///
/// Used inside worker processes, and directly by the controller for node-pinned tests.
#[derive(Clone, Debug, Default)]
pub struct TestExecutor {
    interpreter: Vec<String>,
}

impl TestExecutor {
    /// Creates a new executor. If `interpreter` is empty, test files are executed directly;
    /// otherwise the test path is appended to it.
    pub fn new(interpreter: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            interpreter: interpreter.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the interpreter command line.
    pub fn interpreter(&self) -> &[String] {
        &self.interpreter
    }

    /// Runs the requested test. Every failure, including failure to start the test, is reported
    /// through the returned outcome.
    pub async fn run(&self, request: ExecuteRequest, isolation: Isolation) -> ExecuteResponse {
        let stopwatch = stopwatch();
        let (outcome, result_file) = match self.run_inner(&request, isolation).await {
            Ok(res) => res,
            Err(error) => (
                Outcome::crash(DisplayErrorChain::new(error).to_string()),
                None,
            ),
        };

        let resources = ResourceUsage {
            peak_rss: imp::peak_rss(),
            gc_time: result_file
                .as_ref()
                .and_then(|file| file.gc_time_secs)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or_default(),
            bytes_allocated: result_file
                .as_ref()
                .and_then(|file| file.bytes_allocated)
                .unwrap_or_default(),
        };

        ExecuteResponse {
            test_id: request.test_id,
            generation: request.generation,
            outcome,
            duration: stopwatch.snapshot().duration,
            resources,
        }
    }

    async fn run_inner(
        &self,
        request: &ExecuteRequest,
        isolation: Isolation,
    ) -> Result<(Outcome, Option<TestResultFile>), TestExecSetupError> {
        let scratch = camino_tempfile::Builder::new()
            .prefix("testfleet-")
            .tempdir()
            .map_err(TestExecSetupError::TempDir)?;
        let result_path = scratch.path().join("result.json");

        // Sandboxed tests run elsewhere, so relative paths must be resolved first.
        let test_path = if isolation == Isolation::Sandboxed && request.path.is_relative() {
            let cwd = std::env::current_dir().map_err(TestExecSetupError::CurrentDir)?;
            let cwd = Utf8PathBuf::try_from(cwd).map_err(|err| {
                TestExecSetupError::CurrentDir(err.into_io_error())
            })?;
            cwd.join(&request.path)
        } else {
            request.path.clone()
        };

        let mut argv: Vec<&str> = self.interpreter.iter().map(String::as_str).collect();
        argv.push(test_path.as_str());
        let program = argv.remove(0);

        let mut command = Command::new(program);
        command.args(&argv);
        if isolation == Isolation::Sandboxed {
            command.env_clear();
            for key in ISOLATION_ENV_ALLOWLIST {
                if let Some(value) = std::env::var_os(key) {
                    command.env(key, value);
                }
            }
            command.current_dir(scratch.path());
        }
        command
            .env(TEST_ID_ENV, request.test_id.as_str())
            .env(SEED_ENV, request.seed.to_string())
            .env(RESULT_PATH_ENV, &result_path)
            // Standard output is the protocol channel in worker processes.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(test_id = %request.test_id, %test_path, ?isolation, "executing test");
        let output = command
            .output()
            .await
            .map_err(|error| TestExecSetupError::Spawn {
                program: program.to_owned(),
                error,
            })?;

        let result_file = match tokio::fs::read_to_string(&result_path).await {
            Ok(contents) => match serde_json::from_str::<TestResultFile>(&contents) {
                Ok(file) => ResultFileState::Present(file),
                Err(err) => ResultFileState::Invalid(err.to_string()),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ResultFileState::Missing,
            Err(err) => ResultFileState::Invalid(err.to_string()),
        };

        let exit = ExitSummary {
            success: output.status.success(),
            description: display_exited_with(output.status),
        };
        Ok(classify(&exit, result_file, &output.stderr))
    }
}

impl LocalExecutor for TestExecutor {
    async fn execute_local(&self, request: ExecuteRequest, isolation: Isolation) -> ExecuteResponse {
        self.run(request, isolation).await
    }
}

#[derive(Debug)]
struct ExitSummary {
    success: bool,
    description: String,
}

#[derive(Debug)]
enum ResultFileState {
    Missing,
    Invalid(String),
    Present(TestResultFile),
}

fn classify(
    exit: &ExitSummary,
    result_file: ResultFileState,
    stderr: &[u8],
) -> (Outcome, Option<TestResultFile>) {
    match result_file {
        ResultFileState::Present(mut file) => {
            if file.failures.is_empty() && exit.success {
                let summary = TestSummary {
                    pass_count: file.pass,
                    broken_count: file.broken,
                };
                return (Outcome::Pass { summary }, Some(file));
            }

            let mut failures = std::mem::take(&mut file.failures);
            if failures.is_empty() {
                failures.push(FailureDetail::new(
                    FailureKind::Error,
                    format!("test process {}", exit.description),
                ));
            }
            let outcome = Outcome::StructuredFailure {
                pass_count: file.pass,
                broken_count: file.broken,
                failures,
            };
            (outcome, Some(file))
        }
        ResultFileState::Invalid(message) => (
            Outcome::crash(format!("failed to read test result file: {message}")),
            None,
        ),
        ResultFileState::Missing if exit.success => (
            Outcome::Pass {
                summary: TestSummary {
                    pass_count: 1,
                    broken_count: 0,
                },
            },
            None,
        ),
        ResultFileState::Missing => {
            let mut info = format!("test process {}", exit.description);
            let tail = output_tail(stderr, STDERR_TAIL_LEN);
            if !tail.is_empty() {
                info.push_str("\n--- stderr ---\n");
                info.push_str(&tail);
            }
            (Outcome::crash(info), None)
        }
    }
}

#[cfg(unix)]
mod imp {
    /// Returns the peak resident set size of this process or any of its waited-for children, in
    /// bytes.
    pub(super) fn peak_rss() -> u64 {
        max_rss(libc::RUSAGE_SELF).max(max_rss(libc::RUSAGE_CHILDREN))
    }

    fn max_rss(who: libc::c_int) -> u64 {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        // SAFETY: getrusage only writes to the provided struct.
        let ret = unsafe { libc::getrusage(who, usage.as_mut_ptr()) };
        if ret != 0 {
            return 0;
        }
        // SAFETY: getrusage succeeded, so the struct is initialized.
        let max_rss = unsafe { usage.assume_init() }.ru_maxrss.max(0) as u64;
        // ru_maxrss is in bytes on macOS and kilobytes everywhere else.
        if cfg!(target_vendor = "apple") {
            max_rss
        } else {
            max_rss * 1024
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub(super) fn peak_rss() -> u64 {
        0
    }
}
