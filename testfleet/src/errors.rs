// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use std::error::Error;
use testfleet_metadata::FleetExitCode;
use testfleet_runner::errors::*;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method, which colorizes errors.

/// An error occurred in a program that testfleet ran, not in testfleet itself.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("profile not found")]
    ProfileNotFound {
        #[from]
        err: ProfileNotFound,
    },
    #[error("failed to create store directory")]
    StoreDirCreateError {
        store_dir: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to read test list")]
    TestListError {
        #[from]
        err: TestListError,
    },
    #[error("failed to determine path to the current executable")]
    CurrentExeFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("failed to build test runner")]
    TestRunnerBuildError {
        #[from]
        err: TestRunnerBuildError,
    },
    #[error("test run aborted")]
    TestRunAborted {
        #[from]
        err: TestRunnerExecuteError,
    },
    #[error("failed to write event")]
    WriteEventError {
        #[from]
        err: WriteEventError,
    },
    #[error("test run failed")]
    TestRunFailed {
        #[from]
        err: RunFailedError,
    },
    #[error("failed to create worker runtime")]
    WorkerRuntimeCreateError {
        #[source]
        err: std::io::Error,
    },
    #[error("worker protocol error")]
    WorkerServeError {
        #[from]
        err: WorkerServeError,
    },
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigParseError { .. }
            | Self::ProfileNotFound { .. }
            | Self::StoreDirCreateError { .. }
            | Self::TestListError { .. }
            | Self::CurrentExeFailed { .. }
            | Self::TestRunnerBuildError { .. }
            | Self::WorkerRuntimeCreateError { .. } => FleetExitCode::SETUP_ERROR,
            Self::TestRunAborted { err } => match err {
                TestRunnerExecuteError::MemoryLimitExceeded { .. } => {
                    FleetExitCode::MEMORY_LIMIT_EXCEEDED
                }
                TestRunnerExecuteError::WorkerSpawn(_) => FleetExitCode::WORKER_SPAWN_FAILED,
            },
            Self::WriteEventError { .. } => FleetExitCode::WRITE_OUTPUT_ERROR,
            Self::TestRunFailed { .. } => FleetExitCode::TEST_RUN_FAILED,
            Self::WorkerServeError { .. } => FleetExitCode::WORKER_PROTOCOL_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::ConfigParseError { err } => {
                error!("{err}");
                err.source()
            }
            Self::ProfileNotFound { err } => {
                error!("{err}");
                err.source()
            }
            Self::StoreDirCreateError { store_dir, err } => {
                error!(
                    "failed to create store dir at `{}`",
                    store_dir.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::TestListError { err } => {
                error!("{err}");
                err.source()
            }
            Self::CurrentExeFailed { err } => {
                error!("failed to determine path to the current executable");
                Some(err as &dyn Error)
            }
            Self::TestRunnerBuildError { err } => {
                error!("failed to build test runner");
                Some(err as &dyn Error)
            }
            Self::TestRunAborted { err } => {
                error!("{err}");
                err.source()
            }
            Self::WriteEventError { err } => {
                error!("failed to write event to output");
                Some(err as &dyn Error)
            }
            Self::TestRunFailed { err } => {
                error!("{}", err.style(styles.warning_text));
                None
            }
            Self::WorkerRuntimeCreateError { err } => {
                error!("failed to create worker runtime");
                Some(err as &dyn Error)
            }
            Self::WorkerServeError { err } => {
                error!("worker failed to serve requests");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
