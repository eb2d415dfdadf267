//! SQLite implementation of [`AccountRepository`]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::domain::account::{AccountCredential, AccountStatus};
use crate::domain::repositories::AccountRepository;

#[derive(Clone)]
pub struct SqliteAccountRepository {
    pool: Arc<SqlitePool>,
}

impl SqliteAccountRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    fn map_row(row: &SqliteRow) -> Result<AccountCredential> {
        let status: String = row.try_get("last_status")?;
        Ok(AccountCredential {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            secret: row.try_get("secret")?,
            enabled: row.try_get("enabled")?,
            last_status: status.parse().map_err(|e: String| anyhow!(e))?,
            last_crawl_at: row.try_get("last_crawl_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

const SELECT_ACCOUNT: &str = r"
    SELECT id, username, secret, enabled, last_status, last_crawl_at, created_at
    FROM accounts
";

#[async_trait]
impl AccountRepository for SqliteAccountRepository {
    async fn create(&self, account: &AccountCredential) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO accounts (id, username, secret, enabled, last_status, last_crawl_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&account.id)
        .bind(&account.username)
        .bind(&account.secret)
        .bind(account.enabled)
        .bind(account.last_status.as_str())
        .bind(account.last_crawl_at)
        .bind(account.created_at)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("Failed to create account {}", account.username))?;
        Ok(())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<AccountCredential>> {
        let row = sqlx::query(&format!("{SELECT_ACCOUNT} WHERE username = ?"))
            .bind(username)
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_all(&self) -> Result<Vec<AccountCredential>> {
        let rows = sqlx::query(&format!("{SELECT_ACCOUNT} ORDER BY created_at ASC, username ASC"))
            .fetch_all(&*self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn find_enabled(&self) -> Result<Vec<AccountCredential>> {
        let rows = sqlx::query(&format!(
            "{SELECT_ACCOUNT} WHERE enabled = 1 ORDER BY created_at ASC, username ASC"
        ))
        .fetch_all(&*self.pool)
        .await?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn set_enabled(&self, username: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE accounts SET enabled = ? WHERE username = ?")
            .bind(enabled)
            .bind(username)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_outcome(
        &self,
        username: &str,
        status: AccountStatus,
        crawled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE accounts
            SET last_status = ?, last_crawl_at = COALESCE(?, last_crawl_at)
            WHERE username = ?
            ",
        )
        .bind(status.as_str())
        .bind(crawled_at)
        .bind(username)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("Failed to update status of account {username}"))?;
        Ok(())
    }

    async fn delete(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE username = ?")
            .bind(username)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&*self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn count_by_status(&self) -> Result<HashMap<AccountStatus, u64>> {
        let rows = sqlx::query("SELECT last_status, COUNT(*) AS total FROM accounts GROUP BY last_status")
            .fetch_all(&*self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("last_status")?;
            let total: i64 = row.try_get("total")?;
            let status: AccountStatus = status.parse().map_err(|e: String| anyhow!(e))?;
            *counts.entry(status).or_default() += u64::try_from(total).unwrap_or_default();
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::DatabaseConnection;

    async fn repository() -> Result<SqliteAccountRepository> {
        let db = DatabaseConnection::new("sqlite::memory:").await?;
        db.migrate().await?;
        Ok(SqliteAccountRepository::new(db.pool().clone()))
    }

    #[tokio::test]
    async fn create_and_find_account() -> Result<()> {
        let repo = repository().await?;
        repo.create(&AccountCredential::new("KR666", "pw")).await?;

        let found = repo.find_by_username("KR666").await?.context("account missing")?;
        assert_eq!(found.secret, "pw");
        assert!(found.enabled);
        assert_eq!(found.last_status, AccountStatus::Idle);
        assert!(repo.find_by_username("nobody").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() -> Result<()> {
        let repo = repository().await?;
        repo.create(&AccountCredential::new("KR666", "pw")).await?;
        assert!(repo.create(&AccountCredential::new("KR666", "other")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_accounts_are_not_enabled() -> Result<()> {
        let repo = repository().await?;
        repo.create(&AccountCredential::new("a", "pw")).await?;
        repo.create(&AccountCredential::new("b", "pw")).await?;

        assert!(repo.set_enabled("b", false).await?);
        assert!(!repo.set_enabled("missing", false).await?);

        let enabled: Vec<_> = repo.find_enabled().await?.into_iter().map(|a| a.username).collect();
        assert_eq!(enabled, vec!["a".to_string()]);
        assert_eq!(repo.count().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn outcome_keeps_previous_crawl_time_on_failure() -> Result<()> {
        let repo = repository().await?;
        repo.create(&AccountCredential::new("KR666", "pw")).await?;

        let crawled_at = Utc::now();
        repo.record_outcome("KR666", AccountStatus::Active, Some(crawled_at)).await?;
        repo.record_outcome("KR666", AccountStatus::Error, None).await?;

        let account = repo.find_by_username("KR666").await?.context("account missing")?;
        assert_eq!(account.last_status, AccountStatus::Error);
        assert_eq!(
            account.last_crawl_at.map(|t| t.timestamp_millis()),
            Some(crawled_at.timestamp_millis())
        );

        let by_status = repo.count_by_status().await?;
        assert_eq!(by_status.get(&AccountStatus::Error), Some(&1));
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_account() -> Result<()> {
        let repo = repository().await?;
        repo.create(&AccountCredential::new("KR666", "pw")).await?;
        assert!(repo.delete("KR666").await?);
        assert!(!repo.delete("KR666").await?);
        assert_eq!(repo.count().await?, 0);
        Ok(())
    }
}
