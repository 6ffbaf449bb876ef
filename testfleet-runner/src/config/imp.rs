// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{MaxRss, SoleWorkerCrash, WorkerCount};
use crate::errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    sync::LazyLock,
    time::Duration,
};
use testfleet_metadata::{Seed, TestId};
use tracing::warn;

/// Trait for handling configuration warnings.
///
/// This trait allows for different warning handling strategies, such as logging warnings
/// (the default behavior) or collecting them for testing purposes.
pub trait ConfigWarnings {
    /// Handle unknown configuration keys found in a configuration file.
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    );
}

/// Default implementation of ConfigWarnings that logs warnings using the tracing crate.
pub struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    ) {
        let config_file = config_file.strip_prefix(workspace_root).unwrap_or(config_file);
        let mut unknown_str = String::new();
        if let (1, Some(key)) = (unknown.len(), unknown.first()) {
            // Print this on the same line.
            unknown_str.push(' ');
            unknown_str.push_str(key);
        } else {
            for ignored_key in unknown {
                unknown_str.push('\n');
                unknown_str.push_str("  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!("ignoring unknown configuration keys in config file {config_file}:{unknown_str}");
    }
}

/// Gets the number of available CPUs and caches the value.
#[inline]
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Overall configuration for testfleet.
///
/// Most runner-specific configuration is managed through [profiles](FleetProfile), obtained
/// through the [`profile`](Self::profile) method.
#[derive(Clone, Debug)]
pub struct FleetConfig {
    workspace_root: Utf8PathBuf,
    inner: FleetConfigImpl,
}

impl FleetConfig {
    /// The default location of the config within the path: `.config/testfleet.toml`, used to read
    /// the config from the given directory.
    pub const CONFIG_PATH: &'static str = ".config/testfleet.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the testfleet config from the given file, or if not specified from
    /// `.config/testfleet.toml` in the workspace root.
    ///
    /// If no config file is specified and the workspace doesn't have `.config/testfleet.toml`,
    /// uses the default config options.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        Self::from_sources_with_warnings(workspace_root, config_file, &mut DefaultConfigWarnings)
    }

    /// Load configuration from the given sources, reporting warnings to `warnings`.
    pub fn from_sources_with_warnings(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let inner = Self::read_from_sources(&workspace_root, config_file, warnings)?;
        Ok(Self {
            workspace_root,
            inner,
        })
    }

    /// Returns the default configuration, with no repository-specific settings applied.
    pub fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        let config = Self::make_default_config()
            .build()
            .expect("default config is always valid");

        let mut unknown = BTreeSet::new();
        let deserialized: FleetConfigDeserialize =
            serde_ignored::deserialize(config, |path: serde_ignored::Path| {
                unknown.insert(path.to_string());
            })
            .expect("default config is always valid");

        // Make sure there aren't any unknown keys in the default config, since it is
        // embedded/shipped with this binary.
        if !unknown.is_empty() {
            panic!(
                "found unknown keys in default config: {}",
                unknown.into_iter().collect::<Vec<_>>().join(", ")
            );
        }

        Self {
            workspace_root: workspace_root.into(),
            inner: deserialized.into_config_impl(),
        }
    }

    /// Returns the profile with the given name, or an error if a profile was specified but not
    /// found.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<FleetProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = self.inner.get_profile(name)?;
        let mut store_dir = self.workspace_root.join(&self.inner.store.dir);
        store_dir.push(name);

        Ok(FleetProfile {
            name: name.to_owned(),
            store_dir,
            default_profile: &self.inner.default_profile,
            custom_profile,
        })
    }

    // ---
    // Helper methods
    // ---

    fn read_from_sources(
        workspace_root: &Utf8Path,
        file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<FleetConfigImpl, ConfigParseError> {
        let (config_file, source) = match file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (config, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;

        if !unknown.is_empty() {
            warnings.unknown_config_keys(&config_file, workspace_root, &unknown);
        }

        let inner = config.into_config_impl();
        for (name, shared_state_test) in inner.all_profiles() {
            if shared_state_test.is_some_and(|id| id.as_str().is_empty()) {
                return Err(ConfigParseError::new(
                    &config_file,
                    ConfigParseErrorKind::EmptySharedStateTest(name.to_owned()),
                ));
            }
        }

        Ok(inner)
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(FleetConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: FleetConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // Both serde_path_to_error and the config crate report the key. Drop the key from
                // the config error for consistency.
                let path = error.path().clone();
                let config_error = error.into_inner();
                let error = match config_error {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

/// A testfleet profile, with settings from the named profile falling back to the default profile
/// key by key.
#[derive(Clone, Debug)]
pub struct FleetProfile<'cfg> {
    name: String,
    store_dir: Utf8PathBuf,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
}

impl<'cfg> FleetProfile<'cfg> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the absolute profile-specific store directory.
    pub fn store_dir(&self) -> &Utf8Path {
        &self.store_dir
    }

    /// Returns the requested number of workers.
    pub fn workers(&self) -> WorkerCount {
        self.custom_profile
            .and_then(|profile| profile.workers)
            .unwrap_or(self.default_profile.workers)
    }

    /// Returns the peak RSS above which a worker is recycled.
    pub fn max_rss(&self) -> MaxRss {
        self.custom_profile
            .and_then(|profile| profile.max_rss)
            .unwrap_or(self.default_profile.max_rss)
    }

    /// Returns true if a worker pool should be used even without loopback networking.
    pub fn force_multiprocess(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.force_multiprocess)
            .unwrap_or(self.default_profile.force_multiprocess)
    }

    /// Returns true if intake stops after the first crash.
    pub fn exit_on_first_error(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.exit_on_first_error)
            .unwrap_or(self.default_profile.exit_on_first_error)
    }

    /// Returns the policy for crashes on a single-worker pool.
    pub fn sole_worker_crash(&self) -> SoleWorkerCrash {
        self.custom_profile
            .and_then(|profile| profile.sole_worker_crash)
            .unwrap_or(self.default_profile.sole_worker_crash)
    }

    /// Returns the tests to hand out first, in order.
    pub fn front_load(&self) -> &'cfg [TestId] {
        self.custom_profile
            .and_then(|profile| profile.front_load.as_deref())
            .unwrap_or(&self.default_profile.front_load)
    }

    /// Returns the node-pinned test that shares state with the controller, if any.
    pub fn shared_state_test(&self) -> Option<&'cfg TestId> {
        self.custom_profile
            .and_then(|profile| profile.shared_state_test.as_ref())
            .or(self.default_profile.shared_state_test.as_ref())
    }

    /// Returns the command used to run each test file.
    pub fn interpreter(&self) -> &'cfg [String] {
        self.custom_profile
            .and_then(|profile| profile.interpreter.as_deref())
            .unwrap_or(&self.default_profile.interpreter)
    }

    /// Returns how long a worker has to exit after being asked to.
    pub fn worker_shutdown_grace(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.worker_shutdown_grace)
            .unwrap_or(self.default_profile.worker_shutdown_grace)
    }

    /// Returns how long a new worker has to become ready.
    pub fn worker_startup_timeout(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.worker_startup_timeout)
            .unwrap_or(self.default_profile.worker_startup_timeout)
    }

    /// Returns how long to wait for dispatchers after an interrupt.
    pub fn interrupt_grace(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.interrupt_grace)
            .unwrap_or(self.default_profile.interrupt_grace)
    }

    /// Returns the configured seed, if any.
    pub fn seed(&self) -> Option<Seed> {
        self.custom_profile
            .and_then(|profile| profile.seed)
            .or(self.default_profile.seed)
    }

    /// Returns the JUnit configuration for this profile, if a path is set.
    pub fn junit(&self) -> Option<JunitConfig<'cfg>> {
        let path = self
            .custom_profile
            .and_then(|profile| profile.junit.path.as_deref())
            .or(self.default_profile.junit.path.as_deref())?;
        Some(JunitConfig::new(
            self.store_dir.join(path),
            self.junit_report_name(),
        ))
    }

    /// Returns the name of the top-level JUnit element, used whether or not a path is set.
    pub fn junit_report_name(&self) -> &'cfg str {
        self.custom_profile
            .and_then(|profile| profile.junit.report_name.as_deref())
            .unwrap_or(&self.default_profile.junit.report_name)
    }
}

/// JUnit configuration for a profile.
#[derive(Clone, Debug)]
pub struct JunitConfig<'cfg> {
    path: Utf8PathBuf,
    report_name: &'cfg str,
}

impl<'cfg> JunitConfig<'cfg> {
    /// Creates a JUnit configuration writing to `path`.
    pub fn new(path: Utf8PathBuf, report_name: &'cfg str) -> Self {
        Self { path, report_name }
    }

    /// Returns the absolute path to the JUnit report.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the name of the JUnit report.
    pub fn report_name(&self) -> &'cfg str {
        self.report_name
    }
}

#[derive(Clone, Debug)]
struct FleetConfigImpl {
    store: StoreConfigImpl,
    default_profile: DefaultProfileImpl,
    other_profiles: HashMap<String, CustomProfileImpl>,
}

impl FleetConfigImpl {
    fn get_profile(&self, profile: &str) -> Result<Option<&CustomProfileImpl>, ProfileNotFound> {
        let custom_profile = match profile {
            FleetConfig::DEFAULT_PROFILE => None,
            other => Some(
                self.other_profiles
                    .get(other)
                    .ok_or_else(|| ProfileNotFound::new(profile, self.all_profile_names()))?,
            ),
        };
        Ok(custom_profile)
    }

    fn all_profile_names(&self) -> impl Iterator<Item = &str> {
        self.other_profiles
            .keys()
            .map(|key| key.as_str())
            .chain(std::iter::once(FleetConfig::DEFAULT_PROFILE))
    }

    /// Returns each profile's name along with its own shared-state test setting.
    fn all_profiles(&self) -> impl Iterator<Item = (&str, Option<&TestId>)> {
        std::iter::once((
            FleetConfig::DEFAULT_PROFILE,
            self.default_profile.shared_state_test.as_ref(),
        ))
        .chain(
            self.other_profiles
                .iter()
                .map(|(name, profile)| (name.as_str(), profile.shared_state_test.as_ref())),
        )
    }
}

// This is the form of `FleetConfig` that gets deserialized.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FleetConfigDeserialize {
    store: StoreConfigImpl,
    #[serde(rename = "profile")]
    profiles: HashMap<String, CustomProfileImpl>,
}

impl FleetConfigDeserialize {
    fn into_config_impl(mut self) -> FleetConfigImpl {
        let p = self
            .profiles
            .remove(FleetConfig::DEFAULT_PROFILE)
            .expect("default profile should exist");
        let default_profile = DefaultProfileImpl::new(p);

        FleetConfigImpl {
            store: self.store,
            default_profile,
            other_profiles: self.profiles,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StoreConfigImpl {
    dir: Utf8PathBuf,
}

#[derive(Clone, Debug)]
struct DefaultProfileImpl {
    workers: WorkerCount,
    max_rss: MaxRss,
    force_multiprocess: bool,
    exit_on_first_error: bool,
    sole_worker_crash: SoleWorkerCrash,
    front_load: Vec<TestId>,
    shared_state_test: Option<TestId>,
    interpreter: Vec<String>,
    worker_shutdown_grace: Duration,
    worker_startup_timeout: Duration,
    interrupt_grace: Duration,
    seed: Option<Seed>,
    junit: DefaultJunitImpl,
}

impl DefaultProfileImpl {
    fn new(p: CustomProfileImpl) -> Self {
        Self {
            workers: p.workers.expect("workers present in default profile"),
            max_rss: p.max_rss.expect("max-rss present in default profile"),
            force_multiprocess: p
                .force_multiprocess
                .expect("force-multiprocess present in default profile"),
            exit_on_first_error: p
                .exit_on_first_error
                .expect("exit-on-first-error present in default profile"),
            sole_worker_crash: p
                .sole_worker_crash
                .expect("sole-worker-crash present in default profile"),
            front_load: p
                .front_load
                .expect("front-load present in default profile"),
            shared_state_test: p.shared_state_test,
            interpreter: p
                .interpreter
                .expect("interpreter present in default profile"),
            worker_shutdown_grace: p
                .worker_shutdown_grace
                .expect("worker-shutdown-grace present in default profile"),
            worker_startup_timeout: p
                .worker_startup_timeout
                .expect("worker-startup-timeout present in default profile"),
            interrupt_grace: p
                .interrupt_grace
                .expect("interrupt-grace present in default profile"),
            seed: p.seed,
            junit: DefaultJunitImpl {
                path: p.junit.path,
                report_name: p
                    .junit
                    .report_name
                    .expect("junit.report-name present in default profile"),
            },
        }
    }
}

#[derive(Clone, Debug)]
struct DefaultJunitImpl {
    path: Option<Utf8PathBuf>,
    report_name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    workers: Option<WorkerCount>,
    #[serde(default)]
    max_rss: Option<MaxRss>,
    #[serde(default)]
    force_multiprocess: Option<bool>,
    #[serde(default)]
    exit_on_first_error: Option<bool>,
    #[serde(default)]
    sole_worker_crash: Option<SoleWorkerCrash>,
    #[serde(default)]
    front_load: Option<Vec<TestId>>,
    #[serde(default)]
    shared_state_test: Option<TestId>,
    #[serde(default)]
    interpreter: Option<Vec<String>>,
    #[serde(default, with = "humantime_serde::option")]
    worker_shutdown_grace: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    worker_startup_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    interrupt_grace: Option<Duration>,
    #[serde(default)]
    seed: Option<Seed>,
    #[serde(default)]
    junit: JunitImpl,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct JunitImpl {
    #[serde(default)]
    path: Option<Utf8PathBuf>,
    #[serde(default)]
    report_name: Option<String>,
}
