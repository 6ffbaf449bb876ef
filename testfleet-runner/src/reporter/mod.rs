// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collecting results and reporting them.
//!
//! Dispatchers append to a [`ResultLog`] and emit [`TestEvent`]s. A [`DisplayReporter`] prints the
//! events as they arrive; once the run is over, a [`ReportAggregator`] turns the log into a
//! [`RunSummary`], which can also be written out with a [`JunitWriter`].

mod aggregator;
mod displayer;
mod events;
mod junit;
mod result_log;

pub use aggregator::*;
pub use displayer::*;
pub use events::*;
pub use junit::*;
pub use result_log::*;
