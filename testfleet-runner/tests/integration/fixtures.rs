// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process stand-ins for worker processes, scripted per test.

use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Result;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use testfleet_metadata::{
    ExecuteRequest, ExecuteResponse, FailureDetail, FailureKind, Outcome, ResourceUsage, TestId,
    TestSummary,
};
use testfleet_runner::{
    config::FleetConfig,
    errors::{TestRunnerExecuteError, WorkerError, WorkerSpawnError},
    list::{TestList, TestTask},
    reporter::{RunSummary, TestEventKind},
    runner::{CancelReason, TestRunnerBuilder},
    signal::{ShutdownEvent, SignalHandlerKind},
    worker::{Isolation, LocalExecutor, Worker, WorkerLabel, WorkerSpawner},
};

/// What a scripted test does when run.
#[derive(Clone, Copy, Debug)]
pub enum Script {
    Pass,
    Fail,
    Crash,
    /// Pass, reporting this peak RSS.
    Rss(u64),
    /// Never finish.
    Hang,
    /// The worker process dies mid-test.
    LoseWorker,
}

/// A record of one execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Execution {
    pub test_id: TestId,
    /// `None` for tests run in the controller.
    pub worker: Option<WorkerLabel>,
    pub isolation: Option<Isolation>,
}

#[derive(Debug, Default)]
pub struct FakeFleet {
    scripts: HashMap<TestId, Script>,
    executions: Mutex<Vec<Execution>>,
    spawned: Mutex<Vec<WorkerLabel>>,
    terminated: Mutex<Vec<WorkerLabel>>,
}

impl FakeFleet {
    pub fn new<'a>(scripts: impl IntoIterator<Item = (&'a str, Script)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .into_iter()
                .map(|(id, script)| (TestId::new(id), script))
                .collect(),
            ..Default::default()
        })
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().clone()
    }

    pub fn executed_ids(&self) -> Vec<String> {
        self.executions()
            .into_iter()
            .map(|execution| execution.test_id.to_string())
            .collect()
    }

    pub fn spawned(&self) -> Vec<WorkerLabel> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<WorkerLabel> {
        self.terminated.lock().unwrap().clone()
    }

    async fn run(
        &self,
        request: ExecuteRequest,
        worker: Option<WorkerLabel>,
        isolation: Option<Isolation>,
    ) -> Result<ExecuteResponse, WorkerError> {
        self.executions.lock().unwrap().push(Execution {
            test_id: request.test_id.clone(),
            worker,
            isolation,
        });

        let script = self
            .scripts
            .get(&request.test_id)
            .copied()
            .unwrap_or(Script::Pass);
        let mut resources = ResourceUsage::default();
        let outcome = match script {
            Script::Pass => pass(),
            Script::Fail => Outcome::StructuredFailure {
                pass_count: 2,
                broken_count: 0,
                failures: vec![FailureDetail::new(FailureKind::Fail, "expected 1, got 2")],
            },
            Script::Crash => Outcome::crash("test process aborted with signal 11 (SIGSEGV)"),
            Script::Rss(peak_rss) => {
                resources.peak_rss = peak_rss;
                pass()
            }
            Script::Hang => std::future::pending().await,
            Script::LoseWorker => {
                return Err(WorkerError::Exited {
                    status: "aborted with signal 9 (SIGKILL)".to_owned(),
                });
            }
        };

        Ok(ExecuteResponse {
            test_id: request.test_id,
            generation: request.generation,
            outcome,
            duration: Duration::from_millis(10),
            resources,
        })
    }
}

fn pass() -> Outcome {
    Outcome::Pass {
        summary: TestSummary {
            pass_count: 1,
            broken_count: 0,
        },
    }
}

#[derive(Debug)]
pub struct FakeSpawner(pub Arc<FakeFleet>);

impl WorkerSpawner for FakeSpawner {
    type Worker = FakeWorker;

    async fn spawn(&self, label: WorkerLabel) -> Result<FakeWorker, WorkerSpawnError> {
        self.0.spawned.lock().unwrap().push(label);
        Ok(FakeWorker {
            label,
            fleet: self.0.clone(),
        })
    }
}

#[derive(Debug)]
pub struct FakeWorker {
    label: WorkerLabel,
    fleet: Arc<FakeFleet>,
}

impl Worker for FakeWorker {
    async fn execute(&mut self, request: ExecuteRequest) -> Result<ExecuteResponse, WorkerError> {
        self.fleet.run(request, Some(self.label), None).await
    }

    async fn terminate(self, _grace: Duration) {
        self.fleet.terminated.lock().unwrap().push(self.label);
    }
}

#[derive(Debug)]
pub struct FakeLocal(pub Arc<FakeFleet>);

impl LocalExecutor for FakeLocal {
    async fn execute_local(&self, request: ExecuteRequest, isolation: Isolation) -> ExecuteResponse {
        let test_id = request.test_id.clone();
        let generation = request.generation;
        match self.0.run(request, None, Some(isolation)).await {
            Ok(response) => response,
            Err(error) => ExecuteResponse {
                test_id,
                generation,
                outcome: Outcome::crash(error.to_string()),
                duration: Duration::ZERO,
                resources: ResourceUsage::default(),
            },
        }
    }
}

pub fn task(id: &str) -> TestTask {
    TestTask {
        id: TestId::new(id),
        path: format!("{id}.sh").into(),
        is_node_pinned: false,
        isolated: true,
    }
}

pub fn pinned(id: &str) -> TestTask {
    TestTask {
        is_node_pinned: true,
        ..task(id)
    }
}

/// A workspace with `.config/testfleet.toml` set to `contents`.
pub fn workspace(contents: &str) -> Result<(Utf8TempDir, FleetConfig)> {
    let dir = camino_tempfile::Builder::new()
        .prefix("testfleet-integration-")
        .tempdir()?;
    let config_dir = dir.path().join(".config");
    std::fs::create_dir_all(&config_dir)?;
    std::fs::write(config_dir.join("testfleet.toml"), contents)?;
    let config = FleetConfig::from_sources(dir.path(), None)?;
    Ok((dir, config))
}

/// The result of [`run`].
pub struct RunOutput {
    pub result: Result<RunSummary, TestRunnerExecuteError>,
    pub events: Vec<TestEventKind>,
}

/// Runs `tasks` against `fleet` with the given config.
///
/// `cancel_on` is called for every event, and may return true to cancel the run.
pub fn run(
    config: &FleetConfig,
    tasks: Vec<TestTask>,
    fleet: &Arc<FakeFleet>,
    mut cancel_on: impl FnMut(&TestEventKind) -> bool + Send,
) -> Result<RunOutput> {
    let list = TestList::new(tasks)?;
    let profile = config.profile(FleetConfig::DEFAULT_PROFILE)?;
    let runner = TestRunnerBuilder::default().build(
        &list,
        &profile,
        SignalHandlerKind::Noop,
        FakeSpawner(fleet.clone()),
        FakeLocal(fleet.clone()),
    )?;

    let controller = runner.interrupt_controller();
    let mut events = Vec::new();
    let result = runner.execute(|event| {
        if cancel_on(&event.kind) {
            controller.cancel(CancelReason::Signal(ShutdownEvent::Interrupt));
        }
        events.push(event.kind);
    });

    Ok(RunOutput { result, events })
}

pub fn never(_: &TestEventKind) -> bool {
    false
}
