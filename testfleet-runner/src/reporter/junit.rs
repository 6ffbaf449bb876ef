// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! JUnit XML output for finished runs.

use super::{NodeStatus, NotRunCause, ReportNode, RunSummary};
use crate::{config::JunitConfig, errors::WriteEventError};
use camino::Utf8Path;
use indexmap::IndexMap;
use itertools::Itertools;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use std::fs::File;
use testfleet_metadata::FailureKind;

/// Writes a [`RunSummary`] as a JUnit report.
///
/// Tests are grouped into suites by the first component of their ID, so `core/arrays` and
/// `core/strings` land in the `core` suite.
#[derive(Clone, Debug)]
pub struct JunitWriter<'cfg> {
    config: JunitConfig<'cfg>,
}

impl<'cfg> JunitWriter<'cfg> {
    /// Creates a new writer for the given config.
    pub fn new(config: JunitConfig<'cfg>) -> Self {
        Self { config }
    }

    /// Writes the report to the configured path, creating parent directories as needed.
    pub fn write(&self, summary: &RunSummary) -> Result<(), WriteEventError> {
        let report = build_report(self.config.report_name(), summary);
        write_report(&report, self.config.path())
    }
}

fn write_report(report: &Report, junit_path: &Utf8Path) -> Result<(), WriteEventError> {
    if let Some(junit_dir) = junit_path.parent() {
        std::fs::create_dir_all(junit_dir).map_err(|error| WriteEventError::Fs {
            file: junit_dir.to_path_buf(),
            error,
        })?;
    }

    let f = File::create(junit_path).map_err(|error| WriteEventError::Fs {
        file: junit_path.to_path_buf(),
        error,
    })?;
    report
        .serialize(f)
        .map_err(|error| WriteEventError::Junit {
            file: junit_path.to_path_buf(),
            error,
        })
}

pub(crate) fn build_report(report_name: &str, summary: &RunSummary) -> Report {
    let mut suites: IndexMap<&str, TestSuite> = IndexMap::new();
    for node in &summary.nodes {
        let suite_name = suite_name(node.name.as_str());
        let suite = suites.entry(suite_name).or_insert_with(|| {
            let mut suite = TestSuite::new(suite_name);
            suite.add_property(("seed", summary.seed.to_string().as_str()));
            suite
        });
        suite.add_test_case(test_case(suite_name, node));
    }

    let mut report = Report::new(report_name);
    report
        .set_timestamp(summary.start_time)
        .set_time(summary.elapsed)
        .add_test_suites(suites.into_values());
    report
}

fn suite_name(test_id: &str) -> &str {
    match test_id.split_once('/') {
        Some((suite, _)) if !suite.is_empty() => suite,
        _ => test_id,
    }
}

fn test_case(suite_name: &str, node: &ReportNode) -> TestCase {
    let status = match node.status {
        NodeStatus::Passed => TestCaseStatus::success(),
        NodeStatus::Failed => {
            let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
            status.set_type("test failure");
            if let Some(first) = node.results.first() {
                status.set_message(first.description.as_str());
            }
            status.set_description(
                node.results
                    .iter()
                    .map(|failure| {
                        let kind = match failure.kind {
                            FailureKind::Fail => "fail",
                            FailureKind::Error => "error",
                        };
                        match &failure.location {
                            Some(location) => {
                                format!("{kind}: {} at {location}", failure.description)
                            }
                            None => format!("{kind}: {}", failure.description),
                        }
                    })
                    .join("\n"),
            );
            status
        }
        NodeStatus::Crashed => {
            let mut status = TestCaseStatus::non_success(NonSuccessKind::Error);
            status.set_type("crash");
            if let Some(crash) = node.results.first() {
                let first_line = crash.description.lines().next().unwrap_or_default();
                status
                    .set_message(first_line)
                    .set_description(crash.description.as_str());
            }
            status
        }
        NodeStatus::NotRun(NotRunCause::Interrupted) => {
            let mut status = TestCaseStatus::non_success(NonSuccessKind::Error);
            status.set_type("interrupted").set_message("interrupted");
            status
        }
        NodeStatus::NotRun(NotRunCause::Skipped) => {
            let mut status = TestCaseStatus::skipped();
            status.set_message("skipped after an earlier crash");
            status
        }
    };

    let mut test_case = TestCase::new(node.name.as_str(), status);
    test_case.set_classname(suite_name).set_time(node.duration);
    test_case
}
