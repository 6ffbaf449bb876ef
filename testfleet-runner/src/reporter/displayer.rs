// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints test events and the final summary to the terminal.
//!
//! Events arrive through a single channel and are written by one consumer, so status lines from
//! concurrent dispatchers are never interleaved.

use super::{NodeStatus, NotRunCause, ResultEntry, RunSummary, TestEvent, TestEventKind, Verdict};
use crate::{
    errors::WriteEventError,
    helpers::{
        display_bytes, format_mib, format_secs, percentage,
        plural::{tests_str, were_plural_if, workers_str},
    },
    list::TestList,
};
use debug_ignore::DebugIgnore;
use owo_colors::{OwoColorize, Style};
use std::io::{self, BufWriter, Write};
use swrite::{SWrite, swrite};
use testfleet_metadata::{FailureKind, Outcome};

/// Where a [`DisplayReporter`] writes its output.
pub enum ReporterStderr<'a> {
    /// Produce output on the (possibly piped) terminal.
    Terminal,

    /// Write output to a buffer.
    Buffer(&'a mut Vec<u8>),
}

/// Test reporter builder.
#[derive(Debug, Default)]
pub struct DisplayReporterBuilder {
    verbose: bool,
}

impl DisplayReporterBuilder {
    /// Sets verbose output: a line is also printed when each test starts.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Creates a new reporter for the given test list.
    pub fn build<'a>(&self, test_list: &TestList, output: ReporterStderr<'a>) -> DisplayReporter<'a> {
        let name_width = test_list
            .iter()
            .map(|task| task.id.as_str().len())
            .max()
            .unwrap_or(0)
            + WORKER_SUFFIX_WIDTH;

        DisplayReporter {
            stderr: output,
            verbose: self.verbose,
            name_width,
            styles: Box::default(),
            crashes: DebugIgnore(Vec::new()),
        }
    }
}

// Room for " (12)" or " (node)" after the test name.
const WORKER_SUFFIX_WIDTH: usize = 8;

const TABLE_HEADER: [&str; 5] = ["Time (s)", "GC (s)", "GC %", "Alloc (MB)", "RSS (MB)"];

/// Functionality to report test results to stderr.
pub struct DisplayReporter<'a> {
    stderr: ReporterStderr<'a>,
    verbose: bool,
    name_width: usize,
    styles: Box<Styles>,
    // Crashes seen during the run, repeated at the end when their detail was suppressed.
    crashes: DebugIgnore<Vec<ResultEntry>>,
}

impl DisplayReporter<'_> {
    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Reports a test event.
    pub fn report_event(&mut self, event: &TestEvent) -> Result<(), WriteEventError> {
        if let TestEventKind::TestFinished {
            entry,
            show_detail: false,
            ..
        } = &event.kind
            && entry.outcome.is_crash()
        {
            self.crashes.push(entry.clone());
        }

        let inner = ReporterInner {
            verbose: self.verbose,
            name_width: self.name_width,
            styles: &self.styles,
        };
        match &mut self.stderr {
            ReporterStderr::Terminal => {
                let mut writer = BufWriter::new(io::stderr());
                inner
                    .write_event(event, &mut writer)
                    .and_then(|()| writer.flush())
                    .map_err(WriteEventError::Io)
            }
            ReporterStderr::Buffer(buf) => inner
                .write_event(event, &mut **buf)
                .map_err(WriteEventError::Io),
        }
    }

    /// Writes the final summary and verdict banner.
    pub fn finish(&mut self, summary: &RunSummary) -> Result<(), WriteEventError> {
        let inner = ReporterInner {
            verbose: self.verbose,
            name_width: self.name_width,
            styles: &self.styles,
        };
        let crashes = &self.crashes;
        match &mut self.stderr {
            ReporterStderr::Terminal => {
                let mut writer = BufWriter::new(io::stderr());
                inner
                    .write_summary(summary, crashes, &mut writer)
                    .and_then(|()| writer.flush())
                    .map_err(WriteEventError::Io)
            }
            ReporterStderr::Buffer(buf) => inner
                .write_summary(summary, crashes, &mut **buf)
                .map_err(WriteEventError::Io),
        }
    }
}

struct ReporterInner<'a> {
    verbose: bool,
    name_width: usize,
    styles: &'a Styles,
}

impl ReporterInner<'_> {
    fn write_event(&self, event: &TestEvent, writer: &mut dyn Write) -> io::Result<()> {
        match &event.kind {
            TestEventKind::RunStarted {
                pool_size,
                pool_test_count,
                node_pinned_count,
                seed,
                max_rss,
            } => {
                write!(writer, "{:>12} ", "Starting".style(self.styles.pass))?;
                write!(
                    writer,
                    "{} {} across {} {}",
                    pool_test_count.style(self.styles.count),
                    tests_str(*pool_test_count),
                    pool_size.style(self.styles.count),
                    workers_str(*pool_size),
                )?;
                if *node_pinned_count > 0 {
                    write!(
                        writer,
                        ", then {} node-pinned {}",
                        node_pinned_count.style(self.styles.count),
                        tests_str(*node_pinned_count),
                    )?;
                }
                writeln!(writer, " (seed {seed}, max RSS {max_rss})")?;
                self.write_header(writer)?;
            }
            TestEventKind::TestStarted { test_id, worker } => {
                if self.verbose {
                    let worker = match worker {
                        Some(label) => label.to_string(),
                        None => "node".to_owned(),
                    };
                    writeln!(
                        writer,
                        "{:>12} {} ({})",
                        "START".style(self.styles.pass),
                        test_id,
                        worker.style(self.styles.worker),
                    )?;
                }
            }
            TestEventKind::TestFinished {
                entry,
                show_detail,
                completed,
                total,
            } => {
                self.write_status_line(entry, *completed, *total, writer)?;
                if *show_detail {
                    self.write_detail(entry, writer)?;
                }
            }
            TestEventKind::WorkerRecycled { old, new, reason } => {
                writeln!(
                    writer,
                    "{:>12} worker {} replaced by {}: {reason}",
                    "RECYCLE".style(self.styles.recycle),
                    old.style(self.styles.worker),
                    new.style(self.styles.worker),
                )?;
            }
            TestEventKind::WorkerReplaceFailed { old, error } => {
                writeln!(
                    writer,
                    "{:>12} worker {} couldn't be replaced, continuing without it: {error}",
                    "RECYCLE".style(self.styles.fail),
                    old.style(self.styles.worker),
                )?;
            }
            TestEventKind::IntakeHalted { test_id, skipped } => {
                writeln!(
                    writer,
                    "{:>12} {} crashed, skipping {} remaining {}",
                    "HALT".style(self.styles.fail),
                    test_id,
                    skipped.style(self.styles.count),
                    tests_str(*skipped),
                )?;
            }
            TestEventKind::RunBeginCancel { reason, running } => {
                writeln!(
                    writer,
                    "{:>12} due to {}: {} {} still running",
                    "Cancelling".style(self.styles.fail),
                    reason.style(self.styles.fail),
                    running.style(self.styles.count),
                    if *running == 1 {
                        "dispatcher"
                    } else {
                        "dispatchers"
                    },
                )?;
            }
            TestEventKind::DispatchersAborted { count } => {
                writeln!(
                    writer,
                    "{:>12} {} {} didn't stop within the grace period",
                    "ABORT".style(self.styles.fail),
                    count.style(self.styles.count),
                    if *count == 1 {
                        "dispatcher"
                    } else {
                        "dispatchers"
                    },
                )?;
            }
            TestEventKind::NodeOnlyStarted { count } => {
                writeln!(
                    writer,
                    "{:>12} {} node-pinned {}",
                    "Running".style(self.styles.pass),
                    count.style(self.styles.count),
                    tests_str(*count),
                )?;
            }
        }
        Ok(())
    }

    fn write_header(&self, writer: &mut dyn Write) -> io::Result<()> {
        write!(writer, "{:>12} {:<width$}", "", "Test (Worker)", width = self.name_width)?;
        for column in TABLE_HEADER {
            write!(writer, " | {column:>10}")?;
        }
        writeln!(writer)
    }

    fn write_status_line(
        &self,
        entry: &ResultEntry,
        completed: usize,
        total: usize,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        let (word, style) = match &entry.outcome {
            Outcome::Pass { .. } => ("PASS", self.styles.pass),
            Outcome::StructuredFailure { failures, .. } if failures.is_empty() => {
                ("PASS", self.styles.pass)
            }
            Outcome::StructuredFailure { .. } => ("FAIL", self.styles.fail),
            Outcome::OpaqueCrash { .. } => ("CRASH", self.styles.fail),
        };
        write!(writer, "{:>12} ", word.style(style))?;

        let worker = match entry.worker {
            Some(label) => label.to_string(),
            None => "node".to_owned(),
        };
        let name = format!("{} ({worker})", entry.test_id);
        write!(writer, "{name:<width$}", width = self.name_width)?;

        let resources = &entry.resources;
        let gc_percent = percentage(resources.gc_time, entry.duration);
        write!(
            writer,
            " | {:>10} | {:>10} | {:>10.1} | {:>10} | {:>10}",
            format_secs(entry.duration),
            format_secs(resources.gc_time),
            gc_percent,
            format_mib(resources.bytes_allocated),
            format_mib(resources.peak_rss),
        )?;
        writeln!(
            writer,
            " [{}/{}]",
            completed.style(self.styles.count),
            total.style(self.styles.count),
        )
    }

    fn write_detail(&self, entry: &ResultEntry, writer: &mut dyn Write) -> io::Result<()> {
        match &entry.outcome {
            Outcome::Pass { .. } => {}
            Outcome::StructuredFailure { failures, .. } => {
                for failure in failures {
                    let kind = match failure.kind {
                        FailureKind::Fail => "fail",
                        FailureKind::Error => "error",
                    };
                    write!(
                        writer,
                        "{:>14}{} {}",
                        "",
                        format!("{kind}:").style(self.styles.fail),
                        failure.description.style(self.styles.fail_output),
                    )?;
                    match &failure.location {
                        Some(location) => writeln!(writer, " at {location}")?,
                        None => writeln!(writer)?,
                    }
                }
            }
            Outcome::OpaqueCrash { info } => {
                for line in info.lines() {
                    writeln!(writer, "{:>14}{}", "", line.style(self.styles.fail_output))?;
                }
            }
        }
        Ok(())
    }

    fn write_summary(
        &self,
        summary: &RunSummary,
        crashes: &[ResultEntry],
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        // Details suppressed during the run are shown once at the end.
        for entry in crashes {
            writeln!(
                writer,
                "{:>12} {}",
                "CRASH".style(self.styles.fail),
                entry.test_id,
            )?;
            self.write_detail(entry, writer)?;
        }

        writeln!(writer, "------------")?;
        let summary_str = self.summary_str(summary);
        writeln!(
            writer,
            "{:>12} [{:>9}s] {}",
            "Summary".style(self.styles.pass),
            format_secs(summary.elapsed),
            summary_str,
        )?;

        let totals = summary.totals();
        let peak_rss = summary
            .nodes
            .iter()
            .map(|node| node.resources.peak_rss)
            .max()
            .unwrap_or(0);
        writeln!(
            writer,
            "{:>12} {} pass, {} fail, {} error, {} broken (peak RSS {})",
            "Checks".style(self.styles.pass),
            totals.pass.style(self.styles.count),
            totals.fail.style(self.styles.count),
            totals.error.style(self.styles.count),
            totals.broken.style(self.styles.count),
            display_bytes(peak_rss),
        )?;

        match summary.verdict() {
            Verdict::Pass => {
                writeln!(writer, "{}", "SUCCESS".style(self.styles.pass))?;
            }
            Verdict::Fail => {
                writeln!(writer, "{}", "FAILURE".style(self.styles.fail))?;
                if summary.skipped_count > 0 {
                    writeln!(
                        writer,
                        "{} {} {} skipped due to failure.",
                        summary.skipped_count.style(self.styles.skip),
                        tests_str(summary.skipped_count),
                        were_plural_if(summary.skipped_count != 1),
                    )?;
                }
                writeln!(writer, "The global RNG seed was {}.", summary.seed)?;
            }
        }
        Ok(())
    }

    fn summary_str(&self, summary: &RunSummary) -> String {
        let passed = summary.count_status(NodeStatus::Passed);
        let failed = summary.count_status(NodeStatus::Failed);
        let crashed = summary.count_status(NodeStatus::Crashed);
        let run = passed + failed + crashed;

        let mut summary_str = String::new();
        swrite!(
            summary_str,
            "{} {} run: {} passed",
            run.style(self.styles.count),
            tests_str(run),
            passed.style(self.styles.pass),
        );
        if failed > 0 {
            swrite!(summary_str, ", {} failed", failed.style(self.styles.fail));
        }
        if crashed > 0 {
            swrite!(summary_str, ", {} crashed", crashed.style(self.styles.fail));
        }
        let interrupted = summary.count_status(NodeStatus::NotRun(NotRunCause::Interrupted));
        if interrupted > 0 {
            swrite!(
                summary_str,
                ", {} interrupted",
                interrupted.style(self.styles.fail),
            );
        }
        let skipped = summary.count_status(NodeStatus::NotRun(NotRunCause::Skipped));
        if skipped > 0 {
            swrite!(summary_str, ", {} skipped", skipped.style(self.styles.skip));
        }
        summary_str
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    fail_output: Style,
    skip: Style,
    recycle: Style,
    worker: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.fail_output = Style::new().magenta();
        self.skip = Style::new().yellow().bold();
        self.recycle = Style::new().magenta().bold();
        self.worker = Style::new().blue().bold();
    }
}
