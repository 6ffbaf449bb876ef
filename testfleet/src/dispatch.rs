// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    errors::Result,
    output::{OutputContext, OutputOpts, OutputWriter, clap_styles},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use supports_color::Stream;
use testfleet_metadata::Seed;
use testfleet_runner::{
    config::{FleetConfig, FleetProfile, JunitConfig, MaxRss, WorkerCount},
    list::TestList,
    reporter::{DisplayReporterBuilder, JunitWriter},
    runner::TestRunnerBuilder,
    signal::SignalHandlerKind,
    worker::{ProcessWorkerSpawner, TestExecutor, serve},
};
use tokio::io::BufReader;
use tracing::debug;

/// Runs a suite of test files across a pool of worker processes.
#[derive(Debug, Parser)]
#[command(version, styles = clap_styles::style())]
pub struct TestfleetApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl TestfleetApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code on success.
    pub fn exec(self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        match self.command {
            Command::Run(opts) => opts.exec(output, output_writer),
            Command::Worker(opts) => opts.exec(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the tests in a manifest
    ///
    /// Pool tests are handed out to worker processes as they become free. Node-pinned tests
    /// run in this process, one at a time, once the pool has drained.
    Run(Box<RunOpts>),

    /// Serve the worker protocol on stdin and stdout
    #[command(name = "__worker", hide = true)]
    Worker(WorkerOpts),
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Path to the test manifest
    #[arg(long, value_name = "PATH")]
    manifest: Utf8PathBuf,

    /// Directory holding `.config/testfleet.toml` and the store directory
    #[arg(long, value_name = "DIR", default_value = ".")]
    workspace_root: Utf8PathBuf,

    /// Config file [default: workspace-root/.config/testfleet.toml]
    #[arg(long, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    /// Testfleet profile to use
    #[arg(long, short = 'P', env = "TESTFLEET_PROFILE")]
    profile: Option<String>,

    #[clap(flatten)]
    runner_opts: TestRunnerOpts,

    #[clap(flatten)]
    reporter_opts: TestReporterOpts,
}

impl RunOpts {
    fn exec(&self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        let config = FleetConfig::from_sources(&self.workspace_root, self.config_file.as_deref())?;
        let profile =
            config.profile(self.profile.as_deref().unwrap_or(FleetConfig::DEFAULT_PROFILE))?;
        let store_dir = profile.store_dir();
        std::fs::create_dir_all(store_dir).map_err(|err| ExpectedError::StoreDirCreateError {
            store_dir: store_dir.to_owned(),
            err,
        })?;

        let test_list = TestList::from_manifest_path(&self.manifest)?;

        let current_exe =
            std::env::current_exe().map_err(|err| ExpectedError::CurrentExeFailed { err })?;
        let spawner = ProcessWorkerSpawner::new(current_exe)
            .args([output.color.to_arg(), "__worker"])
            .args(
                profile
                    .interpreter()
                    .iter()
                    .map(|arg| format!("--interpreter={arg}")),
            )
            .startup_timeout(profile.worker_startup_timeout());
        let local = TestExecutor::new(profile.interpreter().iter().cloned());

        let runner = self.runner_opts.to_builder().build(
            &test_list,
            &profile,
            SignalHandlerKind::Standard,
            spawner,
            local,
        )?;
        debug!(
            "running {} tests with {} workers",
            test_list.len(),
            runner.pool_size()
        );

        let mut reporter = DisplayReporterBuilder::default()
            .set_verbose(output.verbose)
            .build(&test_list, output_writer.reporter_output());
        if output.color.should_colorize(Stream::Stderr) {
            reporter.colorize();
        }

        // Keep the first write error and stop reporting after it.
        let mut write_error = None;
        let result = runner.execute(|event| {
            if write_error.is_none()
                && let Err(err) = reporter.report_event(&event)
            {
                write_error = Some(err);
            }
        });
        if let Some(err) = write_error {
            return Err(err.into());
        }

        let summary = result?;
        reporter.finish(&summary)?;

        if let Some(junit) = self.reporter_opts.junit_config(&profile) {
            JunitWriter::new(junit).write(&summary)?;
        }

        summary.check()?;
        Ok(0)
    }
}

/// Test runner options.
#[derive(Debug, Default, Args)]
#[command(next_help_heading = "Runner options")]
struct TestRunnerOpts {
    /// Number of worker processes [default: from profile]
    #[arg(
        long,
        short = 'j',
        value_name = "N",
        allow_negative_numbers = true,
        env = "TESTFLEET_WORKERS"
    )]
    workers: Option<WorkerCount>,

    /// Recycle workers whose peak RSS exceeds this size [default: from profile]
    #[arg(long, value_name = "SIZE", env = "TESTFLEET_MAX_RSS")]
    max_rss: Option<MaxRss>,

    /// Use a worker pool even if loopback networking is unavailable
    #[arg(long, env = "TESTFLEET_FORCE_MULTIPROCESS")]
    force_multiprocess: bool,

    /// Stop handing out tests after the first crash
    #[arg(long, env = "TESTFLEET_EXIT_ON_ERROR")]
    exit_on_first_error: bool,

    /// RNG seed handed to every test, in hexadecimal [default: from profile, or random]
    #[arg(long, value_name = "HEX", env = "TESTFLEET_SEED")]
    seed: Option<Seed>,
}

impl TestRunnerOpts {
    fn to_builder(&self) -> TestRunnerBuilder {
        let mut builder = TestRunnerBuilder::default();
        if let Some(workers) = self.workers {
            builder.set_workers(workers);
        }
        if let Some(max_rss) = self.max_rss {
            builder.set_max_rss(max_rss);
        }
        // Flags can only turn these on; the profile decides otherwise.
        if self.force_multiprocess {
            builder.set_force_multiprocess(true);
        }
        if self.exit_on_first_error {
            builder.set_exit_on_first_error(true);
        }
        if let Some(seed) = self.seed {
            builder.set_seed(seed);
        }

        builder
    }
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "Reporter options")]
struct TestReporterOpts {
    /// Write a JUnit report to this path [default: from profile]
    #[arg(long, value_name = "PATH")]
    junit: Option<Utf8PathBuf>,
}

impl TestReporterOpts {
    fn junit_config<'cfg>(&self, profile: &FleetProfile<'cfg>) -> Option<JunitConfig<'cfg>> {
        match &self.junit {
            Some(path) => Some(JunitConfig::new(path.clone(), profile.junit_report_name())),
            None => profile.junit(),
        }
    }
}

#[derive(Debug, Args)]
struct WorkerOpts {
    /// Interpreter argument, repeated once per argument
    #[arg(long = "interpreter", value_name = "ARG", allow_hyphen_values = true)]
    interpreter: Vec<String>,
}

impl WorkerOpts {
    fn exec(&self) -> Result<i32> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ExpectedError::WorkerRuntimeCreateError { err })?;
        let executor = TestExecutor::new(self.interpreter.iter().cloned());

        runtime.block_on(serve(
            &executor,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        ))?;
        Ok(0)
    }
}
