//! Repository interfaces for the monitor's current-state store
//!
//! The SQLite implementations live in the infrastructure layer; the
//! orchestrator and gateway only see these traits.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::account::{AccountCredential, AccountStatus};
use crate::domain::record::{AccumulatedRecord, KeywordStat, NaturalKey};

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn create(&self, account: &AccountCredential) -> Result<()>;
    async fn find_by_username(&self, username: &str) -> Result<Option<AccountCredential>>;
    async fn find_all(&self) -> Result<Vec<AccountCredential>>;
    /// Accounts eligible for scheduled cycles
    async fn find_enabled(&self) -> Result<Vec<AccountCredential>>;
    /// Returns false when no such account exists
    async fn set_enabled(&self, username: &str, enabled: bool) -> Result<bool>;
    /// Store the outcome of a crawl; `crawled_at` is only written when present
    async fn record_outcome(
        &self,
        username: &str,
        status: AccountStatus,
        crawled_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn delete(&self, username: &str) -> Result<bool>;
    async fn count(&self) -> Result<u64>;
    async fn count_by_status(&self) -> Result<HashMap<AccountStatus, u64>>;
}

#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Insert or replace by natural key
    async fn upsert(&self, record: &AccumulatedRecord) -> Result<()>;
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<AccumulatedRecord>>;
    /// Newest first, optionally limited to one account
    async fn find_all(&self, account: Option<&str>) -> Result<Vec<AccumulatedRecord>>;
    async fn count(&self) -> Result<u64>;
    async fn latest_observation(&self) -> Result<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait KeywordStatRepository: Send + Sync {
    /// Add `count` hits for `keyword` seen on `account`. Totals only grow.
    async fn increment(
        &self,
        keyword: &str,
        count: u64,
        account: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn find_all(&self) -> Result<Vec<KeywordStat>>;
}
