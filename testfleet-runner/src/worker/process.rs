// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Worker, WorkerLabel, WorkerSpawner};
use crate::{
    errors::{WorkerError, WorkerSpawnError},
    helpers::display_exited_with,
};
use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
    process::Stdio,
    time::Duration,
};
use testfleet_metadata::{ExecuteRequest, ExecuteResponse, WorkRequest, WorkResponse};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
};
use tracing::{debug, warn};

/// Starts worker processes by executing a program that speaks the worker protocol on its standard
/// streams.
///
/// Standard error is inherited, so worker logs end up on the controller's terminal.
#[derive(Clone, Debug)]
pub struct ProcessWorkerSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    startup_timeout: Duration,
}

impl ProcessWorkerSpawner {
    /// Creates a new spawner for `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            startup_timeout: Duration::from_secs(30),
        }
    }

    /// Appends arguments passed to every worker.
    pub fn args(mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Self {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// Sets an environment variable for every worker.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Sets how long a worker has to announce that it's ready.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

impl WorkerSpawner for ProcessWorkerSpawner {
    type Worker = ProcessWorker;

    async fn spawn(&self, label: WorkerLabel) -> Result<ProcessWorker, WorkerSpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|error| WorkerSpawnError::Exec {
                worker: label,
                error,
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(WorkerSpawnError::Exec {
                worker: label,
                error: std::io::Error::other("worker standard streams were not captured"),
            });
        };

        let mut worker = ProcessWorker {
            label,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
        };

        match tokio::time::timeout(self.startup_timeout, worker.recv()).await {
            Ok(Ok(WorkResponse::Ready { pid })) => {
                debug!("worker {label} ready (pid {pid})");
                Ok(worker)
            }
            Ok(Ok(other)) => Err(WorkerSpawnError::Handshake {
                worker: label,
                error: WorkerError::UnexpectedMessage {
                    message: other.to_line().trim_end().to_owned(),
                },
            }),
            Ok(Err(error)) => Err(WorkerSpawnError::Handshake {
                worker: label,
                error,
            }),
            Err(_) => Err(WorkerSpawnError::StartupTimeout {
                worker: label,
                timeout: self.startup_timeout,
            }),
        }
    }
}

/// A worker running as a child process.
#[derive(Debug)]
pub struct ProcessWorker {
    label: WorkerLabel,
    child: Child,
    // None once the exit request has been sent.
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ProcessWorker {
    /// Returns the worker's label.
    pub fn label(&self) -> WorkerLabel {
        self.label
    }

    async fn send(&mut self, request: &WorkRequest) -> Result<(), WorkerError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            WorkerError::Write(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        })?;
        let line = request.to_line();
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(WorkerError::Write)?;
        stdin.flush().await.map_err(WorkerError::Write)
    }

    async fn recv(&mut self) -> Result<WorkResponse, WorkerError> {
        loop {
            match self.stdout.next_line().await.map_err(WorkerError::Read)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(WorkResponse::from_line(&line)?),
                None => {
                    let status = match self.child.wait().await {
                        Ok(status) => display_exited_with(status),
                        Err(error) => format!("exit status unavailable: {error}"),
                    };
                    return Err(WorkerError::Exited { status });
                }
            }
        }
    }

    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        matches!(
            tokio::time::timeout(grace, self.child.wait()).await,
            Ok(Ok(_))
        )
    }
}

impl Worker for ProcessWorker {
    async fn execute(&mut self, request: ExecuteRequest) -> Result<ExecuteResponse, WorkerError> {
        let expected_generation = request.generation;
        let test_id = request.test_id.clone();
        self.send(&WorkRequest::Execute(request)).await?;

        loop {
            match self.recv().await? {
                WorkResponse::Completed(response)
                    if response.generation == expected_generation
                        && response.test_id == test_id =>
                {
                    return Ok(response);
                }
                WorkResponse::Completed(response) => {
                    warn!(
                        "worker {} discarding stale response for `{}` (generation {})",
                        self.label, response.test_id, response.generation,
                    );
                }
                other => {
                    return Err(WorkerError::UnexpectedMessage {
                        message: other.to_line().trim_end().to_owned(),
                    });
                }
            }
        }
    }

    async fn terminate(mut self, grace: Duration) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }

        // Ask nicely first. Closing stdin also signals EOF to the serve loop.
        if self.send(&WorkRequest::Exit).await.is_ok() {
            self.stdin = None;
            if self.wait_for_exit(grace).await {
                debug!("worker {} exited", self.label);
                return;
            }
        }
        self.stdin = None;

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::{
                sys::signal::{Signal, kill},
                unistd::Pid,
            };
            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                && self.wait_for_exit(grace).await
            {
                debug!("worker {} exited after SIGTERM", self.label);
                return;
            }
        }

        warn!("worker {} did not exit in time, killing it", self.label);
        if let Err(error) = self.child.kill().await {
            warn!("failed to kill worker {}: {error}", self.label);
        }
    }
}
