//! Domain module - accounts, report records and the accumulation rules
//!
//! Nothing in here talks to the browser or the database; repository traits
//! are implemented in the infrastructure layer.

pub mod account;
pub mod accumulation;
pub mod record;
pub mod repositories;

pub use account::{AccountCredential, AccountStatus};
pub use accumulation::{AccumulationEngine, KeywordScanner, RESET_THRESHOLD, Reconciliation, reconcile_count};
pub use record::{AccumulatedRecord, KeywordStat, NaturalKey, RawRecord};
pub use repositories::{AccountRepository, KeywordStatRepository, RecordRepository};
