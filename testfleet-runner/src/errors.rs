// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testfleet.

use crate::worker::WorkerLabel;
use bytesize::ByteSize;
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{fmt, time::Duration};
use testfleet_metadata::{ProtocolDecodeError, TestId};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse testfleet config at `{config_file}`")]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// `shared-state-test` was set to an empty string in the given profile.
    #[error("profile `{0}`: `shared-state-test` must not be empty")]
    EmptySharedStateTest(String),
}

/// An error which indicates that a profile was requested but not known to testfleet.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurs while parsing a [`WorkerCount`](crate::config::WorkerCount) value from a
/// string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for worker count: {input}: {message}")]
pub struct WorkerCountParseError {
    input: String,
    message: String,
}

impl WorkerCountParseError {
    pub(crate) fn new(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            message: message.into(),
        }
    }
}

/// An error that occurs while parsing a [`MaxRss`](crate::config::MaxRss) value from a string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for max-rss: {input}: {message}")]
pub struct MaxRssParseError {
    input: String,
    message: String,
}

impl MaxRssParseError {
    pub(crate) fn new(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            message: message.into(),
        }
    }
}

/// An error that occurred while reading the test manifest.
#[derive(Debug, Error)]
pub enum TestListError {
    /// The manifest could not be read.
    #[error("failed to read test manifest at `{path}`")]
    Read {
        /// The manifest path.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The manifest is not valid TOML, or has an unexpected shape.
    #[error("failed to parse test manifest at `{path}`")]
    Parse {
        /// The manifest path.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: toml::de::Error,
    },

    /// The same test ID was listed more than once.
    #[error("test `{id}` is listed more than once")]
    DuplicateTestId {
        /// The duplicated ID.
        id: TestId,
    },

    /// A test ID was empty.
    #[error("test #{index} has an empty ID")]
    EmptyTestId {
        /// The zero-based position of the entry in the manifest.
        index: usize,
    },
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that occurred while starting a worker.
#[derive(Debug, Error)]
pub enum WorkerSpawnError {
    /// The worker process could not be started.
    #[error("failed to start worker {worker}")]
    Exec {
        /// The worker that failed to start.
        worker: WorkerLabel,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The worker started, but didn't announce that it was ready.
    #[error("worker {worker} failed its startup handshake")]
    Handshake {
        /// The worker that failed to start.
        worker: WorkerLabel,

        /// The underlying error.
        #[source]
        error: WorkerError,
    },

    /// The worker didn't announce that it was ready in time.
    #[error("worker {worker} did not become ready within {}", humantime_fmt(*.timeout))]
    StartupTimeout {
        /// The worker that failed to start.
        worker: WorkerLabel,

        /// How long the controller waited.
        timeout: Duration,
    },
}

/// An error that occurred while communicating with a worker.
///
/// The dispatcher turns these into crash outcomes for the test that was in flight.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Writing a request to the worker failed.
    #[error("failed to write request to worker")]
    Write(#[source] std::io::Error),

    /// Reading a response from the worker failed.
    #[error("failed to read response from worker")]
    Read(#[source] std::io::Error),

    /// The worker closed its output stream.
    #[error("worker exited unexpectedly ({status})")]
    Exited {
        /// A description of how the worker exited.
        status: String,
    },

    /// The worker sent a line that isn't a valid response.
    #[error(transparent)]
    Decode(#[from] ProtocolDecodeError),

    /// The worker answered a request sent to a different generation.
    #[error("worker replied for generation {actual}, expected {expected}")]
    StaleResponse {
        /// The generation the request was sent to.
        expected: u64,

        /// The generation in the response.
        actual: u64,
    },

    /// The worker sent something other than a response to the request.
    #[error("worker sent unexpected message: {message}")]
    UnexpectedMessage {
        /// The message, re-serialized.
        message: String,
    },
}

/// An error that occurred while serving requests inside a worker process.
#[derive(Debug, Error)]
pub enum WorkerServeError {
    /// Reading from standard input failed.
    #[error("failed to read request")]
    Read(#[source] std::io::Error),

    /// Writing to standard output failed.
    #[error("failed to write response")]
    Write(#[source] std::io::Error),

    /// A request couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] ProtocolDecodeError),
}

/// An error that occurred while building a [`TestRunner`](crate::runner::TestRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// An error occurred while setting up signals.
    #[error("error setting up signals")]
    SignalHandlerSetupError(#[from] SignalHandlerSetupError),
}

/// An error that aborted a test run before a report could be produced.
#[derive(Debug, Error)]
pub enum TestRunnerExecuteError {
    /// A test exceeded the memory limit on the only worker, so the run was halted.
    #[error(
        "halting tests: memory limit reached (test `{test_id}` peaked at {peak_rss}, limit is {max_rss})"
    )]
    MemoryLimitExceeded {
        /// The test that exceeded the limit.
        test_id: TestId,

        /// The peak RSS reported for the test.
        peak_rss: ByteSize,

        /// The configured limit.
        max_rss: ByteSize,
    },

    /// The initial workers could not be started.
    #[error("failed to start worker pool")]
    WorkerSpawn(#[from] WorkerSpawnError),
}

/// The aggregate failure raised after a failing run has been reported.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "test run failed: {failed} failed, {crashed} crashed, {interrupted} interrupted, {skipped} skipped"
)]
pub struct RunFailedError {
    /// The number of tests with structured failures.
    pub failed: usize,

    /// The number of tests that crashed.
    pub crashed: usize,

    /// The number of tests interrupted by cancellation.
    pub interrupted: usize,

    /// The number of tests skipped after intake was halted.
    pub skipped: usize,
}

/// An error that occurs while writing an event or a report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteEventError {
    /// An error occurred while writing the event to the provided output.
    #[error("error writing to output")]
    Io(#[from] std::io::Error),

    /// An error occurred while operating on the file system.
    #[error("error operating on path {file}")]
    Fs {
        /// The file being written to.
        file: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        error: std::io::Error,
    },

    /// An error occurred while producing JUnit XML.
    #[error("error writing JUnit output to {file}")]
    Junit {
        /// The output file.
        file: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: quick_junit::SerializeError,
    },
}

fn humantime_fmt(duration: Duration) -> impl fmt::Display {
    humantime_serde::re::humantime::format_duration(duration)
}

/// An error that prevented a test from being started.
///
/// The executor reports these as crash outcomes for the test.
#[derive(Debug, Error)]
pub enum TestExecSetupError {
    /// The scratch directory for the test couldn't be created.
    #[error("failed to create scratch directory")]
    TempDir(#[source] std::io::Error),

    /// The controller's working directory couldn't be determined.
    #[error("failed to determine current directory")]
    CurrentDir(#[source] std::io::Error),

    /// The test process couldn't be started.
    #[error("failed to execute `{program}`")]
    Spawn {
        /// The program that was executed.
        program: String,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// Displays an error along with its chain of sources.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        while let Some(error) = source {
            write!(f, "\n  caused by: {error}")?;
            source = error.source();
        }
        Ok(())
    }
}
