//! SQLite implementation of [`RecordRepository`]
//!
//! One row per natural key. Upserts replace every column, so writing the
//! same reconciled record twice leaves the table unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::domain::record::{AccumulatedRecord, NaturalKey, RawRecord};
use crate::domain::repositories::RecordRepository;

#[derive(Clone)]
pub struct SqliteRecordRepository {
    pool: Arc<SqlitePool>,
}

impl SqliteRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    fn map_row(row: &SqliteRow) -> Result<AccumulatedRecord> {
        let keywords: String = row.try_get("anomaly_keywords")?;
        let anomaly_keywords: BTreeMap<String, u32> =
            serde_json::from_str(&keywords).context("Corrupt anomaly_keywords column")?;

        Ok(AccumulatedRecord {
            raw: RawRecord {
                account_username: row.try_get("account_username")?,
                sequence_number: row.try_get("sequence_number")?,
                ip: row.try_get("ip")?,
                category: row.try_get("category")?,
                display_name: row.try_get("display_name")?,
                level: row.try_get("level")?,
                guild_name: row.try_get("guild_name")?,
                skill_tag: row.try_get("skill_tag")?,
                count_current: row.try_get("count_current")?,
                count_total: row.try_get("count_total")?,
                elapsed_time: row.try_get("elapsed_time")?,
                status_text: row.try_get("status_text")?,
                runtime: row.try_get("runtime")?,
            },
            accumulated_count: row.try_get("accumulated_count")?,
            anomaly_keywords,
            observed_at: row.try_get("observed_at")?,
        })
    }
}

const SELECT_RECORD: &str = r"
    SELECT account_username, sequence_number, ip, category, display_name, level,
           guild_name, skill_tag, count_current, count_total, elapsed_time,
           status_text, runtime, accumulated_count, anomaly_keywords, observed_at
    FROM crawler_records
";

#[async_trait]
impl RecordRepository for SqliteRecordRepository {
    async fn upsert(&self, record: &AccumulatedRecord) -> Result<()> {
        let keywords = serde_json::to_string(&record.anomaly_keywords)?;
        let raw = &record.raw;

        sqlx::query(
            r"
            INSERT INTO crawler_records
            (account_username, sequence_number, ip, category, display_name, level,
             guild_name, skill_tag, count_current, count_total, elapsed_time,
             status_text, runtime, accumulated_count, anomaly_keywords, observed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (account_username, sequence_number, ip) DO UPDATE SET
                category = excluded.category,
                display_name = excluded.display_name,
                level = excluded.level,
                guild_name = excluded.guild_name,
                skill_tag = excluded.skill_tag,
                count_current = excluded.count_current,
                count_total = excluded.count_total,
                elapsed_time = excluded.elapsed_time,
                status_text = excluded.status_text,
                runtime = excluded.runtime,
                accumulated_count = excluded.accumulated_count,
                anomaly_keywords = excluded.anomaly_keywords,
                observed_at = excluded.observed_at
            ",
        )
        .bind(&raw.account_username)
        .bind(raw.sequence_number)
        .bind(&raw.ip)
        .bind(&raw.category)
        .bind(&raw.display_name)
        .bind(raw.level)
        .bind(&raw.guild_name)
        .bind(&raw.skill_tag)
        .bind(raw.count_current)
        .bind(raw.count_total)
        .bind(&raw.elapsed_time)
        .bind(&raw.status_text)
        .bind(&raw.runtime)
        .bind(record.accumulated_count)
        .bind(keywords)
        .bind(record.observed_at)
        .execute(&*self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to upsert record {}#{}@{}",
                raw.account_username, raw.sequence_number, raw.ip
            )
        })?;
        Ok(())
    }

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<AccumulatedRecord>> {
        let row = sqlx::query(&format!(
            "{SELECT_RECORD} WHERE account_username = ? AND sequence_number = ? AND ip = ?"
        ))
        .bind(&key.account_username)
        .bind(key.sequence_number)
        .bind(&key.ip)
        .fetch_optional(&*self.pool)
        .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_all(&self, account: Option<&str>) -> Result<Vec<AccumulatedRecord>> {
        let rows = match account {
            Some(account) => {
                sqlx::query(&format!(
                    "{SELECT_RECORD} WHERE account_username = ? ORDER BY observed_at DESC, sequence_number ASC"
                ))
                .bind(account)
                .fetch_all(&*self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_RECORD} ORDER BY observed_at DESC, account_username ASC, sequence_number ASC"
                ))
                .fetch_all(&*self.pool)
                .await?
            }
        };
        rows.iter().map(Self::map_row).collect()
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM crawler_records")
            .fetch_one(&*self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn latest_observation(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT observed_at FROM crawler_records ORDER BY observed_at DESC LIMIT 1")
            .fetch_optional(&*self.pool)
            .await?;
        Ok(row
            .map(|row| row.try_get::<DateTime<Utc>, _>("observed_at"))
            .transpose()?)
    }
}
