// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::TestListError;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashSet;
use testfleet_metadata::TestId;
use tracing::warn;

/// A single test to be run.
///
/// Created once at startup from the manifest, and consumed exactly once: either dispatched and
/// resolved, or declared interrupted or skipped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestTask {
    /// The test's identifier.
    pub id: TestId,

    /// The test file handed to the interpreter.
    pub path: Utf8PathBuf,

    /// True if this test must run in the controller after the worker pool drains.
    pub is_node_pinned: bool,

    /// For node-pinned tests, whether the test runs in a fresh sandbox.
    pub isolated: bool,
}

/// The ordered list of tests for a run, as produced by [`TestList::from_manifest_path`] or
/// [`TestList::new`].
#[derive(Clone, Debug)]
pub struct TestList {
    tasks: IndexMap<TestId, TestTask>,
}

impl TestList {
    /// Creates a new test list from tasks, in the given order.
    pub fn new(tasks: impl IntoIterator<Item = TestTask>) -> Result<Self, TestListError> {
        let mut map = IndexMap::new();
        for (index, task) in tasks.into_iter().enumerate() {
            if task.id.as_str().is_empty() {
                return Err(TestListError::EmptyTestId { index });
            }
            if map.contains_key(&task.id) {
                return Err(TestListError::DuplicateTestId { id: task.id });
            }
            map.insert(task.id.clone(), task);
        }
        Ok(Self { tasks: map })
    }

    /// Reads a TOML test manifest.
    ///
    /// Relative test paths are resolved against the manifest's directory.
    pub fn from_manifest_path(path: &Utf8Path) -> Result<Self, TestListError> {
        let contents = std::fs::read_to_string(path).map_err(|error| TestListError::Read {
            path: path.to_owned(),
            error,
        })?;
        let base_dir = path.parent().unwrap_or(Utf8Path::new(""));
        Self::from_manifest_str(path, base_dir, &contents)
    }

    /// Parses a TOML test manifest from a string. `path` is only used in error messages.
    pub fn from_manifest_str(
        path: &Utf8Path,
        base_dir: &Utf8Path,
        contents: &str,
    ) -> Result<Self, TestListError> {
        let manifest: ManifestDeserialize =
            toml::from_str(contents).map_err(|error| TestListError::Parse {
                path: path.to_owned(),
                error,
            })?;

        Self::new(manifest.test.into_iter().map(|entry| {
            let path = entry
                .path
                .unwrap_or_else(|| Utf8PathBuf::from(entry.id.as_str()));
            TestTask {
                path: base_dir.join(path),
                id: entry.id,
                is_node_pinned: entry.node_pinned,
                isolated: entry.isolated,
            }
        }))
    }

    /// Returns the number of tests.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if there are no tests.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Iterates over tasks in manifest order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &TestTask> {
        self.tasks.values()
    }

    /// Returns the task with the given ID.
    pub fn get(&self, id: &str) -> Option<&TestTask> {
        self.tasks.get(id)
    }

    /// Applies the seeding policy: `front_load` tests move to the front in the order given, then
    /// node-pinned tests are split out. Both halves keep their relative order.
    pub fn partition(&self, front_load: &[TestId]) -> SeedPlan {
        let mut seen = HashSet::new();
        let mut ordered = Vec::with_capacity(self.tasks.len());
        for id in front_load {
            match self.tasks.get(id) {
                Some(task) if seen.insert(id) => ordered.push(task.clone()),
                Some(_) => {}
                None => warn!("front-loaded test `{id}` is not in the test list, ignoring"),
            }
        }
        ordered.extend(
            self.tasks
                .values()
                .filter(|task| !seen.contains(&task.id))
                .cloned(),
        );

        let (node_pinned, pool) = ordered.into_iter().partition(|task| task.is_node_pinned);
        SeedPlan { pool, node_pinned }
    }
}

/// The result of [`TestList::partition`].
#[derive(Clone, Debug, Default)]
pub struct SeedPlan {
    /// Tests dispatched to the worker pool, in dispatch order.
    pub pool: Vec<TestTask>,

    /// Tests run sequentially in the controller after the pool drains, in pin order.
    pub node_pinned: Vec<TestTask>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestDeserialize {
    #[serde(default)]
    test: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ManifestEntry {
    id: TestId,
    #[serde(default)]
    path: Option<Utf8PathBuf>,
    #[serde(default)]
    node_pinned: bool,
    #[serde(default = "default_isolated")]
    isolated: bool,
}

fn default_isolated() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = indoc! {r#"
        [[test]]
        id = "core/arrays"
        path = "core/arrays.sh"

        [[test]]
        id = "core/strings"

        [[test]]
        id = "distributed/shared"
        node-pinned = true
        isolated = false

        [[test]]
        id = "distributed/remote"
        node-pinned = true

        [[test]]
        id = "slow/linalg"
    "#};

    fn ids(tasks: &[TestTask]) -> Vec<&str> {
        tasks.iter().map(|task| task.id.as_str()).collect()
    }

    #[test]
    fn parse_manifest() {
        let list = TestList::from_manifest_str(
            Utf8Path::new("tests.toml"),
            Utf8Path::new("/suite"),
            MANIFEST,
        )
        .unwrap();
        assert_eq!(list.len(), 5);

        let arrays = list.get("core/arrays").unwrap();
        assert_eq!(arrays.path, "/suite/core/arrays.sh");
        assert!(!arrays.is_node_pinned);
        assert!(arrays.isolated);

        let strings = list.get("core/strings").unwrap();
        assert_eq!(strings.path, "/suite/core/strings");

        let shared = list.get("distributed/shared").unwrap();
        assert!(shared.is_node_pinned);
        assert!(!shared.isolated);
    }

    #[test]
    fn partition_front_loads_then_splits() {
        let list = TestList::from_manifest_str(
            Utf8Path::new("tests.toml"),
            Utf8Path::new("/suite"),
            MANIFEST,
        )
        .unwrap();
        let plan = list.partition(&[
            TestId::new("slow/linalg"),
            TestId::new("missing"),
            TestId::new("distributed/remote"),
            TestId::new("slow/linalg"),
        ]);

        assert_eq!(
            ids(&plan.pool),
            ["slow/linalg", "core/arrays", "core/strings"]
        );
        // Front-loading a pinned test moves it earlier in pin order too.
        assert_eq!(
            ids(&plan.node_pinned),
            ["distributed/remote", "distributed/shared"]
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let contents = indoc! {r#"
            [[test]]
            id = "a"

            [[test]]
            id = "a"
        "#};
        let err = TestList::from_manifest_str(
            Utf8Path::new("tests.toml"),
            Utf8Path::new(""),
            contents,
        )
        .unwrap_err();
        assert!(
            matches!(err, TestListError::DuplicateTestId { ref id } if id.as_str() == "a"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn unknown_manifest_keys_are_rejected() {
        let contents = indoc! {r#"
            [[test]]
            id = "a"
            pinned = true
        "#};
        let err = TestList::from_manifest_str(
            Utf8Path::new("tests.toml"),
            Utf8Path::new(""),
            contents,
        )
        .unwrap_err();
        assert!(matches!(err, TestListError::Parse { .. }), "unexpected error: {err}");
    }
}
