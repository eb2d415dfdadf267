//! Persistence and notification gateway
//!
//! Upserts reconciled records, adds this cycle's keyword hits to the global
//! totals and fans the batch out to live subscribers. Failures are counted
//! and logged here; the caller decides what they mean for the account.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::crawling::error::CrawlError;
use crate::crawling::notifier::{CrawlerUpdate, NotificationHub};
use crate::domain::record::AccumulatedRecord;
use crate::domain::repositories::{KeywordStatRepository, RecordRepository};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub upserted: usize,
    pub failed: usize,
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct PersistenceGateway {
    records: Arc<dyn RecordRepository>,
    keywords: Arc<dyn KeywordStatRepository>,
    hub: NotificationHub,
}

impl PersistenceGateway {
    pub fn new(
        records: Arc<dyn RecordRepository>,
        keywords: Arc<dyn KeywordStatRepository>,
        hub: NotificationHub,
    ) -> Self {
        Self { records, keywords, hub }
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    pub fn records(&self) -> &Arc<dyn RecordRepository> {
        &self.records
    }

    /// Replace or insert by natural key
    pub async fn upsert(&self, record: &AccumulatedRecord) -> Result<(), CrawlError> {
        self.records
            .upsert(record)
            .await
            .map_err(|e| CrawlError::PersistenceFailure(format!("{e:#}")))
    }

    /// Push a batch to every live subscriber
    pub fn notify(&self, account: &str, records: Vec<AccumulatedRecord>) -> (usize, usize) {
        let delivery = self.hub.notify(CrawlerUpdate::new(account, records));
        (delivery.delivered, delivery.dropped)
    }

    /// Persist one account's batch and notify subscribers.
    ///
    /// Each record is written independently, so one failed upsert does not
    /// stop the rest. An empty batch is not announced.
    pub async fn publish(&self, account: &str, records: Vec<AccumulatedRecord>) -> PublishReport {
        let mut report = PublishReport::default();

        for record in &records {
            match self.upsert(record).await {
                Ok(()) => report.upserted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(account, sequence = record.raw.sequence_number, error = %e, "upsert failed");
                }
            }
        }

        self.record_keywords(account, &records).await;

        if !records.is_empty() {
            let (delivered, dropped) = self.notify(account, records);
            report.delivered = delivered;
            report.dropped = dropped;
        }

        debug!(
            account,
            upserted = report.upserted,
            failed = report.failed,
            delivered = report.delivered,
            "batch published"
        );
        report
    }

    /// Totals only ever grow by this cycle's hits
    async fn record_keywords(&self, account: &str, records: &[AccumulatedRecord]) {
        let mut hits: BTreeMap<&str, u64> = BTreeMap::new();
        for record in records {
            for (keyword, count) in &record.anomaly_keywords {
                *hits.entry(keyword.as_str()).or_default() += u64::from(*count);
            }
        }

        let seen_at = Utc::now();
        for (keyword, count) in hits {
            if let Err(e) = self.keywords.increment(keyword, count, account, seen_at).await {
                warn!(account, keyword, error = %e, "keyword stat update failed");
            }
        }
    }
}
