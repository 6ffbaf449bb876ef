// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decisions made after each test about the worker that ran it.

use crate::config::{MaxRss, SoleWorkerCrash};
use bytesize::ByteSize;
use std::fmt;
use testfleet_metadata::{Outcome, ResourceUsage};

/// Why a worker was replaced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecycleReason {
    /// The test crashed.
    Crashed,

    /// The worker process died or stopped speaking the protocol.
    WorkerLost,

    /// The worker's peak RSS went over the limit.
    MemoryLimit {
        /// The peak RSS reported.
        peak_rss: ByteSize,

        /// The configured limit.
        max_rss: ByteSize,
    },
}

impl fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crashed => write!(f, "test crashed"),
            Self::WorkerLost => write!(f, "worker lost"),
            Self::MemoryLimit { peak_rss, max_rss } => {
                write!(f, "peak RSS {peak_rss} exceeded limit of {max_rss}")
            }
        }
    }
}

/// What a dispatcher does after recording a test's outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecycleDecision {
    /// Keep using the same worker.
    Continue,

    /// Replace the worker before the next test.
    Replace(RecycleReason),

    /// Discard every pending test and stop dispatching.
    DrainAndStop,

    /// Abort the whole run.
    Abort {
        /// The peak RSS reported.
        peak_rss: ByteSize,

        /// The configured limit.
        max_rss: ByteSize,
    },
}

/// Replaces workers that grow past the memory limit.
#[derive(Clone, Copy, Debug)]
pub struct MemoryGovernor {
    max_rss: MaxRss,
    pool_size: usize,
}

impl MemoryGovernor {
    /// Creates a new governor for a pool of `pool_size` workers.
    pub fn new(max_rss: MaxRss, pool_size: usize) -> Self {
        Self { max_rss, pool_size }
    }

    /// Checks the resources reported for a test.
    ///
    /// With a single worker there's nothing to fall back on, so a breach aborts the run.
    pub fn check(&self, resources: &ResourceUsage) -> RecycleDecision {
        let Some(max_rss) = self.max_rss.limit() else {
            return RecycleDecision::Continue;
        };
        if !self.max_rss.is_exceeded_by(resources.peak_rss) {
            return RecycleDecision::Continue;
        }

        let peak_rss = ByteSize::b(resources.peak_rss);
        if self.pool_size > 1 {
            RecycleDecision::Replace(RecycleReason::MemoryLimit { peak_rss, max_rss })
        } else {
            RecycleDecision::Abort { peak_rss, max_rss }
        }
    }
}

/// Replaces or halts on crashes.
#[derive(Clone, Copy, Debug)]
pub struct FailureRecycler {
    exit_on_first_error: bool,
    sole_worker_crash: SoleWorkerCrash,
    pool_size: usize,
}

impl FailureRecycler {
    /// Creates a new recycler for a pool of `pool_size` workers.
    pub fn new(
        exit_on_first_error: bool,
        sole_worker_crash: SoleWorkerCrash,
        pool_size: usize,
    ) -> Self {
        Self {
            exit_on_first_error,
            sole_worker_crash,
            pool_size,
        }
    }

    /// Returns true if crashes stop the run.
    pub fn exit_on_first_error(&self) -> bool {
        self.exit_on_first_error
    }

    /// Checks a test's outcome. `worker_lost` is true if the outcome was synthesized because the
    /// worker itself failed.
    ///
    /// Structured failures never recycle.
    pub fn check(&self, outcome: &Outcome, worker_lost: bool) -> RecycleDecision {
        if !outcome.is_crash() {
            return RecycleDecision::Continue;
        }
        if self.exit_on_first_error {
            return RecycleDecision::DrainAndStop;
        }
        if self.pool_size > 1 {
            let reason = if worker_lost {
                RecycleReason::WorkerLost
            } else {
                RecycleReason::Crashed
            };
            return RecycleDecision::Replace(reason);
        }

        match self.sole_worker_crash {
            SoleWorkerCrash::Halt => RecycleDecision::DrainAndStop,
            // A dead process can't be reused, so it's respawned in place.
            SoleWorkerCrash::Reuse if worker_lost => {
                RecycleDecision::Replace(RecycleReason::WorkerLost)
            }
            SoleWorkerCrash::Reuse => RecycleDecision::Continue,
        }
    }
}

/// Combines the [`FailureRecycler`] and [`MemoryGovernor`] into one decision per test.
#[derive(Clone, Copy, Debug)]
pub struct RecyclePolicy {
    /// Checks crashes.
    pub recycler: FailureRecycler,

    /// Checks memory use.
    pub governor: MemoryGovernor,
}

impl RecyclePolicy {
    /// Decides what happens to the worker after a test.
    ///
    /// The crash decision comes first. Memory is only checked if the worker would otherwise keep
    /// running.
    pub fn decide(
        &self,
        outcome: &Outcome,
        resources: &ResourceUsage,
        worker_lost: bool,
    ) -> RecycleDecision {
        match self.recycler.check(outcome, worker_lost) {
            RecycleDecision::Continue => self.governor.check(resources),
            decision => decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use testfleet_metadata::{FailureDetail, FailureKind, TestSummary};

    fn pass() -> Outcome {
        Outcome::Pass {
            summary: TestSummary::default(),
        }
    }

    fn structured_failure() -> Outcome {
        Outcome::StructuredFailure {
            pass_count: 1,
            broken_count: 0,
            failures: vec![FailureDetail::new(FailureKind::Fail, "nope")],
        }
    }

    fn crash() -> Outcome {
        Outcome::crash("segfault")
    }

    fn policy(
        max_rss: MaxRss,
        exit_on_first_error: bool,
        sole_worker_crash: SoleWorkerCrash,
        pool_size: usize,
    ) -> RecyclePolicy {
        RecyclePolicy {
            recycler: FailureRecycler::new(exit_on_first_error, sole_worker_crash, pool_size),
            governor: MemoryGovernor::new(max_rss, pool_size),
        }
    }

    fn rss(peak_rss: u64) -> ResourceUsage {
        ResourceUsage {
            peak_rss,
            ..Default::default()
        }
    }

    const LIMIT: MaxRss = MaxRss::Limit(ByteSize::b(1000));

    #[test_case(pass(), false, 4, RecycleDecision::Continue ; "pass")]
    #[test_case(structured_failure(), false, 4, RecycleDecision::Continue ; "structured failure")]
    #[test_case(crash(), false, 4, RecycleDecision::Replace(RecycleReason::Crashed) ; "crash with pool")]
    #[test_case(crash(), true, 4, RecycleDecision::Replace(RecycleReason::WorkerLost) ; "lost worker with pool")]
    #[test_case(crash(), false, 1, RecycleDecision::Continue ; "crash on sole worker is reused")]
    #[test_case(crash(), true, 1, RecycleDecision::Replace(RecycleReason::WorkerLost) ; "lost sole worker is respawned")]
    fn crash_decisions(
        outcome: Outcome,
        worker_lost: bool,
        pool_size: usize,
        expected: RecycleDecision,
    ) {
        let policy = policy(MaxRss::Unlimited, false, SoleWorkerCrash::Reuse, pool_size);
        assert_eq!(policy.decide(&outcome, &rss(10_000), worker_lost), expected);
    }

    #[test_case(4 ; "with pool")]
    #[test_case(1 ; "sole worker")]
    fn exit_on_first_error_drains(pool_size: usize) {
        let policy = policy(LIMIT, true, SoleWorkerCrash::Reuse, pool_size);
        assert_eq!(
            policy.decide(&crash(), &rss(0), false),
            RecycleDecision::DrainAndStop
        );
        assert_eq!(
            policy.decide(&structured_failure(), &rss(0), false),
            RecycleDecision::Continue
        );
    }

    #[test]
    fn sole_worker_halt() {
        let policy = policy(MaxRss::Unlimited, false, SoleWorkerCrash::Halt, 1);
        assert_eq!(
            policy.decide(&crash(), &rss(0), false),
            RecycleDecision::DrainAndStop
        );
    }

    #[test_case(4, 1000, RecycleDecision::Continue ; "at limit")]
    #[test_case(4, 1001, RecycleDecision::Replace(RecycleReason::MemoryLimit {
        peak_rss: ByteSize::b(1001),
        max_rss: ByteSize::b(1000),
    }) ; "over limit with pool")]
    #[test_case(1, 1001, RecycleDecision::Abort {
        peak_rss: ByteSize::b(1001),
        max_rss: ByteSize::b(1000),
    } ; "over limit on sole worker")]
    fn memory_decisions(pool_size: usize, peak_rss: u64, expected: RecycleDecision) {
        let policy = policy(LIMIT, false, SoleWorkerCrash::Reuse, pool_size);
        assert_eq!(policy.decide(&pass(), &rss(peak_rss), false), expected);
        assert_eq!(
            policy.decide(&structured_failure(), &rss(peak_rss), false),
            expected
        );
    }

    #[test]
    fn unlimited_never_recycles() {
        let policy = policy(MaxRss::Unlimited, false, SoleWorkerCrash::Reuse, 1);
        assert_eq!(
            policy.decide(&pass(), &rss(u64::MAX), false),
            RecycleDecision::Continue
        );
    }
}
