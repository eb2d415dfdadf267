//! xiaoba-crawler - multi-account report monitor
//!
//! Signs in to a report site with many accounts on a fixed schedule, reads
//! the report table of each account, turns the site's resetting counters into
//! monotonically growing totals and stores the current state in SQLite while
//! pushing every account's fresh batch to live subscribers.

pub mod application;
pub mod cli;
pub mod crawling;
pub mod domain;
pub mod infrastructure;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
