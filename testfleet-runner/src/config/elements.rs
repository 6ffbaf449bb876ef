// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::get_num_cpus,
    errors::{MaxRssParseError, WorkerCountParseError},
};
use bytesize::ByteSize;
use serde::Deserialize;
use std::{cmp::Ordering, fmt, str::FromStr};

/// Type for the `workers` config key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerCount {
    /// Run with a specified number of workers.
    Count(usize),

    /// Run with a number of workers equal to the logical CPU count.
    NumCpus,
}

impl WorkerCount {
    /// Gets the actual number of workers computed at runtime.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(workers) => workers,
            Self::NumCpus => get_num_cpus(),
        }
    }
}

impl FromStr for WorkerCount {
    type Err = WorkerCountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }

        match s.parse::<isize>() {
            Err(e) => Err(WorkerCountParseError::new(s, e.to_string())),
            Ok(0) => Err(WorkerCountParseError::new(s, "workers may not be 0")),
            Ok(j) if j < 0 => Ok(WorkerCount::Count(
                (get_num_cpus() as isize + j).max(1) as usize,
            )),
            Ok(j) => Ok(WorkerCount::Count(j as usize)),
        }
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(workers) => write!(f, "{workers}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for WorkerCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = WorkerCount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "an integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(WorkerCount::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v.cmp(&0) {
                    Ordering::Greater => Ok(WorkerCount::Count(v as usize)),
                    Ordering::Less => Ok(WorkerCount::Count(
                        (get_num_cpus() as i64 + v).max(1) as usize,
                    )),
                    Ordering::Equal => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    )),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Type for the `max-rss` config key: the peak resident set size above which a worker is recycled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MaxRss {
    /// Workers are never recycled for memory use.
    #[default]
    Unlimited,

    /// Workers whose peak RSS exceeds this are recycled.
    Limit(ByteSize),
}

impl MaxRss {
    /// Returns the limit in bytes, if any.
    pub fn limit(self) -> Option<ByteSize> {
        match self {
            Self::Unlimited => None,
            Self::Limit(limit) => Some(limit),
        }
    }

    /// Returns true if `peak_rss` exceeds this limit.
    pub fn is_exceeded_by(self, peak_rss: u64) -> bool {
        match self {
            Self::Unlimited => false,
            Self::Limit(limit) => peak_rss > limit.as_u64(),
        }
    }

    fn from_bytes(bytes: u64) -> Self {
        if bytes == 0 {
            Self::Unlimited
        } else {
            Self::Limit(ByteSize::b(bytes))
        }
    }
}

impl FromStr for MaxRss {
    type Err = MaxRssParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "unlimited" {
            return Ok(Self::Unlimited);
        }
        s.parse::<ByteSize>()
            .map(|size| Self::from_bytes(size.as_u64()))
            .map_err(|message| MaxRssParseError::new(s, message))
    }
}

impl fmt::Display for MaxRss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Limit(limit) => write!(f, "{limit}"),
        }
    }
}

impl<'de> Deserialize<'de> for MaxRss {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = MaxRss;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(
                    formatter,
                    "a number of bytes, a size string like \"2 GiB\", or \"unlimited\""
                )
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse().map_err(|_| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Str(v), &self)
                })
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v).map(MaxRss::from_bytes).map_err(|_| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Signed(v), &self)
                })
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(MaxRss::from_bytes(v))
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Type for the `sole-worker-crash` config key.
///
/// Only consulted when a test crashes and the pool has a single worker, so there is no other
/// worker to fall back on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SoleWorkerCrash {
    /// Keep running the remaining tests on the same worker.
    #[default]
    Reuse,

    /// Stop taking new tests. Tests left in the queue are reported as skipped.
    Halt,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("num-cpus", Some(WorkerCount::NumCpus); "num-cpus")]
    #[test_case("3", Some(WorkerCount::Count(3)); "positive")]
    #[test_case("0", None; "zero")]
    #[test_case("many", None; "garbage")]
    fn parse_worker_count(input: &str, expected: Option<WorkerCount>) {
        assert_eq!(input.parse::<WorkerCount>().ok(), expected);
    }

    #[test]
    fn negative_worker_count_is_relative() {
        let count: WorkerCount = "-1".parse().unwrap();
        assert_eq!(count.compute(), (get_num_cpus() - 1).max(1));
    }

    #[test_case("0", MaxRss::Unlimited; "zero is unlimited")]
    #[test_case("unlimited", MaxRss::Unlimited; "unlimited")]
    #[test_case("1024", MaxRss::Limit(ByteSize::b(1024)); "bytes")]
    #[test_case("2 MiB", MaxRss::Limit(ByteSize::mib(2)); "mebibytes")]
    fn parse_max_rss(input: &str, expected: MaxRss) {
        assert_eq!(input.parse::<MaxRss>().unwrap(), expected);
    }

    #[test]
    fn max_rss_threshold_is_strict() {
        let limit = MaxRss::Limit(ByteSize::b(100));
        assert!(!limit.is_exceeded_by(100));
        assert!(limit.is_exceeded_by(101));
        assert!(!MaxRss::Unlimited.is_exceeded_by(u64::MAX));
    }
}
