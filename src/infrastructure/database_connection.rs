// Database connection and pool management
// SQLite current-state store: accounts, reconciled records and keyword totals

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tracing::debug;

/// Concurrent account tasks queue on the write lock this long before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, 5).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        if !in_memory {
            let db_path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            let db_path = db_path.split('?').next().unwrap_or(db_path);
            if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url: {database_url}"))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        // Every connection to :memory: is its own database, so pin a single one for the pool's lifetime
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {database_url}"))?;

        debug!(database_url, in_memory, "database pool opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_accounts_sql = r"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                secret TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                last_status TEXT NOT NULL DEFAULT 'idle',
                last_crawl_at DATETIME,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        ";

        let create_records_sql = r"
            CREATE TABLE IF NOT EXISTS crawler_records (
                account_username TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                ip TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT '',
                display_name TEXT NOT NULL DEFAULT '',
                level INTEGER NOT NULL DEFAULT 0,
                guild_name TEXT NOT NULL DEFAULT '',
                skill_tag TEXT NOT NULL DEFAULT '',
                count_current INTEGER NOT NULL DEFAULT 0,
                count_total INTEGER NOT NULL DEFAULT 0,
                elapsed_time TEXT NOT NULL DEFAULT '',
                status_text TEXT NOT NULL DEFAULT '',
                runtime TEXT NOT NULL DEFAULT '',
                accumulated_count INTEGER NOT NULL DEFAULT 0,
                anomaly_keywords TEXT NOT NULL DEFAULT '{}',
                observed_at DATETIME NOT NULL,
                PRIMARY KEY (account_username, sequence_number, ip)
            )
        ";

        let create_keyword_stats_sql = r"
            CREATE TABLE IF NOT EXISTS keyword_stats (
                keyword TEXT PRIMARY KEY,
                total_count INTEGER NOT NULL DEFAULT 0,
                accounts_affected TEXT NOT NULL DEFAULT '[]',
                last_seen_at DATETIME NOT NULL
            )
        ";

        let create_indexes_sql = r"
            CREATE INDEX IF NOT EXISTS idx_records_observed_at ON crawler_records (observed_at);
            CREATE INDEX IF NOT EXISTS idx_accounts_enabled ON accounts (enabled);
        ";

        sqlx::query(create_accounts_sql).execute(&self.pool).await?;
        sqlx::query(create_records_sql).execute(&self.pool).await?;
        sqlx::query(create_keyword_stats_sql).execute(&self.pool).await?;
        sqlx::query(create_indexes_sql).execute(&self.pool).await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
