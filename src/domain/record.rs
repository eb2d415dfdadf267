//! Report rows as scraped, and as reconciled across cycles

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of one monitored entity: (account, sequence number, ip).
///
/// The record store keeps at most one row per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub account_username: String,
    pub sequence_number: i64,
    pub ip: String,
}

/// One data row of the post-login report table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub account_username: String,
    pub sequence_number: i64,
    pub ip: String,
    pub category: String,
    pub display_name: String,
    pub level: i64,
    pub guild_name: String,
    pub skill_tag: String,
    pub count_current: i64,
    pub count_total: i64,
    pub elapsed_time: String,
    pub status_text: String,
    pub runtime: String,
}

impl RawRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            account_username: self.account_username.clone(),
            sequence_number: self.sequence_number,
            ip: self.ip.clone(),
        }
    }

    /// Free-text fields scanned for anomaly keywords
    pub fn scanned_fields(&self) -> [&str; 7] {
        [
            &self.category,
            &self.display_name,
            &self.guild_name,
            &self.skill_tag,
            &self.status_text,
            &self.runtime,
            &self.elapsed_time,
        ]
    }
}

/// A raw row plus its running lifetime total and detected anomaly keywords
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatedRecord {
    #[serde(flatten)]
    pub raw: RawRecord,
    pub accumulated_count: i64,
    pub anomaly_keywords: BTreeMap<String, u32>,
    pub observed_at: DateTime<Utc>,
}

impl AccumulatedRecord {
    pub fn natural_key(&self) -> NaturalKey {
        self.raw.natural_key()
    }

    pub fn account_username(&self) -> &str {
        &self.raw.account_username
    }
}

/// Cross-account aggregate for one anomaly keyword
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordStat {
    pub keyword: String,
    pub total_count: i64,
    pub accounts_affected: BTreeSet<String>,
    pub last_seen_at: DateTime<Utc>,
}
