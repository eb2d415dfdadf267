//! SQLite implementation of [`KeywordStatRepository`]

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::record::KeywordStat;
use crate::domain::repositories::KeywordStatRepository;

#[derive(Clone)]
pub struct SqliteKeywordStatRepository {
    pool: Arc<SqlitePool>,
}

impl SqliteKeywordStatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl KeywordStatRepository for SqliteKeywordStatRepository {
    async fn increment(
        &self,
        keyword: &str,
        count: u64,
        account: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        // Single statement: the write lock is taken up front and waits on the busy handler
        let count = i64::try_from(count).unwrap_or(i64::MAX);

        sqlx::query(
            r"
            INSERT INTO keyword_stats (keyword, total_count, accounts_affected, last_seen_at)
            VALUES (?1, ?2, json_array(?3), ?4)
            ON CONFLICT (keyword) DO UPDATE SET
                total_count = keyword_stats.total_count + excluded.total_count,
                accounts_affected = CASE
                    WHEN EXISTS (SELECT 1 FROM json_each(keyword_stats.accounts_affected) WHERE value = ?3)
                        THEN keyword_stats.accounts_affected
                    ELSE json_insert(keyword_stats.accounts_affected, '$[#]', ?3)
                END,
                last_seen_at = MAX(keyword_stats.last_seen_at, excluded.last_seen_at)
            ",
        )
        .bind(keyword)
        .bind(count)
        .bind(account)
        .bind(seen_at)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("Failed to increment keyword stat {keyword}"))?;

        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<KeywordStat>> {
        let rows = sqlx::query(
            "SELECT keyword, total_count, accounts_affected, last_seen_at FROM keyword_stats ORDER BY total_count DESC, keyword ASC",
        )
        .fetch_all(&*self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<KeywordStat> {
                let accounts: String = row.try_get("accounts_affected")?;
                Ok(KeywordStat {
                    keyword: row.try_get("keyword")?,
                    total_count: row.try_get("total_count")?,
                    accounts_affected: serde_json::from_str(&accounts)
                        .context("Corrupt accounts_affected column")?,
                    last_seen_at: row.try_get("last_seen_at")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::DatabaseConnection;

    async fn repository() -> Result<SqliteKeywordStatRepository> {
        let db = DatabaseConnection::new("sqlite::memory:").await?;
        db.migrate().await?;
        Ok(SqliteKeywordStatRepository::new(db.pool().clone()))
    }

    #[tokio::test]
    async fn increments_accumulate_and_track_accounts() -> Result<()> {
        let repo = repository().await?;
        let now = Utc::now();
        repo.increment("网络异常", 2, "KR666", now).await?;
        repo.increment("网络异常", 1, "KR777", now).await?;
        repo.increment("网络异常", 3, "KR666", now).await?;
        repo.increment("掉线", 1, "KR666", now).await?;

        let stats = repo.find_all().await?;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].keyword, "网络异常");
        assert_eq!(stats[0].total_count, 6);
        assert_eq!(
            stats[0].accounts_affected.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["KR666", "KR777"]
        );
        assert_eq!(stats[1].total_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_increments_on_a_file_database_are_not_lost() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let url = format!("sqlite:{}", dir.path().join("stats.db").display());
        let db = DatabaseConnection::new(&url).await?;
        db.migrate().await?;
        let repo = SqliteKeywordStatRepository::new(db.pool().clone());

        let now = Utc::now();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..40 {
            let repo = repo.clone();
            let account = format!("KR{}", i % 4);
            tasks.spawn(async move { repo.increment("网络异常", 1, &account, now).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        let stats = repo.find_all().await?;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_count, 40);
        assert_eq!(
            stats[0].accounts_affected.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["KR0", "KR1", "KR2", "KR3"]
        );
        db.close().await;
        Ok(())
    }
}
