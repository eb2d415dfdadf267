//! Application wiring
//!
//! Builds the full object graph from configuration: logging, database,
//! repositories, the notification hub, the persistence gateway and the
//! orchestrator. The CLI works only through [`AppContext`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::crawling::browser::BrowserLauncher;
use crate::crawling::gateway::PersistenceGateway;
use crate::crawling::notifier::NotificationHub;
use crate::crawling::orchestrator::CrawlOrchestrator;
use crate::infrastructure::config::{AppConfig, ConfigManager, RuntimeConfig, SettingsChange, SharedConfig};
use crate::infrastructure::logging::{init_logging_with_config, log_system_info};
use crate::infrastructure::{
    DatabaseConnection, SqliteAccountRepository, SqliteKeywordStatRepository, SqliteRecordRepository,
    WebDriverLauncher,
};

pub struct AppContext {
    pub config: AppConfig,
    pub config_manager: ConfigManager,
    pub database: DatabaseConnection,
    pub accounts: Arc<SqliteAccountRepository>,
    pub records: Arc<SqliteRecordRepository>,
    pub keyword_stats: Arc<SqliteKeywordStatRepository>,
    pub hub: NotificationHub,
    pub orchestrator: CrawlOrchestrator,
}

impl AppContext {
    /// Load configuration, start logging and open the database.
    ///
    /// `config_path` overrides the file under the platform config directory.
    pub async fn bootstrap(config_path: Option<PathBuf>) -> Result<Self> {
        let manager = match config_path {
            Some(path) => ConfigManager::with_path(path),
            None => ConfigManager::new()?,
        };
        let config = manager.load_config().await?;

        init_logging_with_config(&config.logging).context("Failed to initialize logging")?;
        log_system_info();
        info!(config_path = %manager.config_path().display(), "configuration loaded");

        let launcher = WebDriverLauncher::new(&config.crawler.webdriver_url)?;
        Self::with_launcher(manager, config, Arc::new(launcher)).await
    }

    /// Wire everything around an existing config and browser launcher
    pub async fn with_launcher(
        config_manager: ConfigManager,
        config: AppConfig,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self> {
        let database_url = config.database.resolved_url()?;
        let database = DatabaseConnection::with_max_connections(&database_url, config.database.max_connections()).await?;
        database.migrate().await?;

        let pool = database.pool().clone();
        let accounts = Arc::new(SqliteAccountRepository::new(pool.clone()));
        let records = Arc::new(SqliteRecordRepository::new(pool.clone()));
        let keyword_stats = Arc::new(SqliteKeywordStatRepository::new(pool));

        let hub = NotificationHub::new();
        let gateway = PersistenceGateway::new(records.clone(), keyword_stats.clone(), hub.clone());
        let shared = SharedConfig::new(RuntimeConfig::from(&config));
        let orchestrator = CrawlOrchestrator::new(shared, launcher, accounts.clone(), gateway)?;

        let restored = orchestrator.restore_baselines().await?;
        if restored > 0 {
            info!(accounts = restored, "resuming from stored baselines");
        }

        Ok(Self {
            config,
            config_manager,
            database,
            accounts,
            records,
            keyword_stats,
            hub,
            orchestrator,
        })
    }

    /// Save a settings change to the config file and hand it to the orchestrator.
    ///
    /// Cycles already running keep their snapshot; the next cycle sees the change.
    pub async fn update_settings(&self, change: &SettingsChange) -> Result<AppConfig> {
        let saved = self
            .config_manager
            .update_config(|config| change.apply(&mut config.crawler, &mut config.anomaly))
            .await?;
        self.orchestrator
            .config()
            .update(|runtime| change.apply(&mut runtime.crawler, &mut runtime.anomaly))
            .await?;
        info!(?change, "settings updated");
        Ok(saved)
    }

    /// Stop the scheduler if it runs and close the database
    pub async fn shutdown(&self) {
        if self.orchestrator.is_running() {
            if let Err(e) = self.orchestrator.stop().await {
                warn!(error = %e, "scheduler did not stop cleanly");
            }
        }
        self.database.close().await;
        info!("shutdown complete");
    }
}
