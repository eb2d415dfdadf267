//! Configuration infrastructure
//!
//! Settings come from three layers, later ones winning:
//! 1. Built-in defaults (see [`defaults`])
//! 2. The JSON config file managed by [`ConfigManager`]
//! 3. `XIAOBA__<SECTION>__<KEY>` environment variables
//!
//! The crawler and anomaly sections can also be changed at runtime through
//! [`SharedConfig`]; a running cycle keeps the snapshot it started with.

#![allow(clippy::uninlined_format_args)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

const APP_DIR_NAME: &str = "xiaoba-crawler";
const CONFIG_FILE_NAME: &str = "xiaoba_crawler_config.json";
const ENV_PREFIX: &str = "XIAOBA";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    FileLoad {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub crawler: CrawlerConfig,
    pub anomaly: AnomalyConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

/// Scheduler, browser session and login settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Login page of the monitored site
    pub target_url: String,

    /// Seconds between scheduled cycles
    pub cycle_interval_secs: u64,

    /// Upper bound on simultaneously open browser sessions
    pub max_concurrent_sessions: usize,

    /// Page-load timeout for each session, in seconds
    pub session_timeout_secs: u64,

    pub headless: bool,

    /// WebDriver endpoint (chromedriver) sessions are created on
    pub webdriver_url: String,

    /// Label of the optional category control clicked before signing in; `None` skips the step
    pub category_label: Option<String>,

    /// Overall budget for one account's task, login through notification
    pub task_deadline_secs: u64,

    /// Directory for per-transition screenshots; `None` disables them
    pub snapshot_dir: Option<PathBuf>,

    /// Seed each account's accumulation baseline from the stored records at startup
    pub restore_baselines: bool,

    pub user_agent: String,
    pub window_width: u32,
    pub window_height: u32,
}

/// Keywords counted in the free-text columns of every row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub keywords: Vec<String>,
}

/// Logging configuration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    pub console_output: bool,
    pub file_output: bool,

    /// Log directory; defaults to `logs/` under the application data dir
    pub log_dir: Option<PathBuf>,

    pub file_name: String,

    /// Number of log files to keep (older files are deleted on startup)
    pub max_files: u32,

    /// Offset applied to log timestamps
    pub utc_offset_hours: i32,

    /// Per-target level overrides, e.g. "sqlx": "warn"
    pub module_filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection url; defaults to a file under the application data dir
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            target_url: defaults::TARGET_URL.to_string(),
            cycle_interval_secs: defaults::CYCLE_INTERVAL_SECS,
            max_concurrent_sessions: defaults::MAX_CONCURRENT_SESSIONS,
            session_timeout_secs: defaults::SESSION_TIMEOUT_SECS,
            headless: defaults::HEADLESS,
            webdriver_url: defaults::WEBDRIVER_URL.to_string(),
            category_label: Some(defaults::CATEGORY_LABEL.to_string()),
            task_deadline_secs: defaults::TASK_DEADLINE_SECS,
            snapshot_dir: None,
            restore_baselines: false,
            user_agent: defaults::USER_AGENT.to_string(),
            window_width: defaults::WINDOW_WIDTH,
            window_height: defaults::WINDOW_HEIGHT,
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            keywords: defaults::ANOMALY_KEYWORDS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            max_files: defaults::LOG_MAX_FILES,
            utc_offset_hours: defaults::LOG_UTC_OFFSET_HOURS,
            module_filters: [
                ("sqlx", "warn"),
                ("reqwest", "info"),
                ("hyper", "warn"),
                ("h2", "warn"),
                ("tokio", "info"),
            ]
            .into_iter()
            .map(|(target, level)| (target.to_string(), level.to_string()))
            .collect(),
        }
    }
}

impl CrawlerConfig {
    pub const fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub const fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.task_deadline_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_url.trim().is_empty() {
            return Err(ConfigError::invalid("target_url must not be empty"));
        }
        url::Url::parse(&self.target_url)
            .map_err(|e| ConfigError::invalid(format!("target_url is not a valid url: {e}")))?;
        url::Url::parse(&self.webdriver_url)
            .map_err(|e| ConfigError::invalid(format!("webdriver_url is not a valid url: {e}")))?;

        if self.cycle_interval_secs == 0 {
            return Err(ConfigError::invalid("cycle_interval_secs must be greater than 0"));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::invalid("max_concurrent_sessions must be greater than 0"));
        }
        if self.session_timeout_secs == 0 {
            return Err(ConfigError::invalid("session_timeout_secs must be greater than 0"));
        }
        if self.task_deadline_secs == 0 {
            return Err(ConfigError::invalid("task_deadline_secs must be greater than 0"));
        }
        Ok(())
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.console_output && !self.file_output {
            return Err(ConfigError::invalid("at least one logging output must be enabled"));
        }
        if !(-23..=23).contains(&self.utc_offset_hours) {
            return Err(ConfigError::invalid("utc_offset_hours must be within -23..=23"));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.crawler.validate()?;
        self.logging.validate()
    }

    /// Load from an optional JSON file plus `XIAOBA__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Like [`AppConfig::load`] but with an explicit environment map instead of the process environment
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            );
        }

        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("anomaly.keywords")
            .source(env);

        let settings = builder.add_source(environment).build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

/// Owns the JSON config file under the platform config directory
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(APP_DIR_NAME);
        Ok(config_dir)
    }

    /// Get application data directory (database, logs, snapshots)
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join(APP_DIR_NAME);
        Ok(data_dir)
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join(CONFIG_FILE_NAME);
        Ok(Self { config_path })
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self { config_path: config_path.into() }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Write the default configuration if no file exists yet.
    ///
    /// A file that is not valid JSON is backed up next to itself and replaced
    /// with defaults.
    pub async fn ensure_exists(&self) -> Result<()> {
        if !fs::try_exists(&self.config_path).await.unwrap_or(false) {
            info!("First run detected - writing default configuration to {:?}", self.config_path);
            return self.save_config(&AppConfig::default()).await;
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;
        if let Err(parse_error) = serde_json::from_str::<serde_json::Value>(&content) {
            warn!("Configuration file is not valid JSON: {}", parse_error);
            let backup_path = self.config_path.with_extension("json.corrupted");
            if let Err(e) = fs::copy(&self.config_path, &backup_path).await {
                warn!("Failed to create backup of corrupted config: {}", e);
            } else {
                info!("Backed up corrupted config to: {:?}", backup_path);
            }
            self.save_config(&AppConfig::default())
                .await
                .context("Failed to save default configuration")?;
        }
        Ok(())
    }

    /// Load file plus environment overrides, creating the file on first run
    pub async fn load_config(&self) -> Result<AppConfig> {
        self.ensure_exists().await?;
        let config = AppConfig::load(Some(&self.config_path))
            .with_context(|| format!("Failed to load configuration from {:?}", self.config_path))?;
        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(config)
    }

    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Modify, validate and save the file contents.
    ///
    /// Environment overrides are not folded in, so they never end up persisted.
    pub async fn update_config<F>(&self, updater: F) -> Result<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        self.ensure_exists().await?;
        let mut config = AppConfig::load_with_env(Some(&self.config_path), Some(HashMap::new()))
            .with_context(|| format!("Failed to load configuration from {:?}", self.config_path))?;
        updater(&mut config);
        config.validate()?;
        self.save_config(&config).await?;
        Ok(config)
    }
}

/// Partial change to the settings a running crawler can pick up between cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsChange {
    pub target_url: Option<String>,
    pub cycle_interval_secs: Option<u64>,
    pub max_concurrent_sessions: Option<usize>,
    pub session_timeout_secs: Option<u64>,
    pub headless: Option<bool>,
    pub keywords: Option<Vec<String>>,
}

impl SettingsChange {
    pub const fn is_empty(&self) -> bool {
        self.target_url.is_none()
            && self.cycle_interval_secs.is_none()
            && self.max_concurrent_sessions.is_none()
            && self.session_timeout_secs.is_none()
            && self.headless.is_none()
            && self.keywords.is_none()
    }

    pub fn apply(&self, crawler: &mut CrawlerConfig, anomaly: &mut AnomalyConfig) {
        if let Some(url) = &self.target_url {
            crawler.target_url.clone_from(url);
        }
        if let Some(secs) = self.cycle_interval_secs {
            crawler.cycle_interval_secs = secs;
        }
        if let Some(sessions) = self.max_concurrent_sessions {
            crawler.max_concurrent_sessions = sessions;
        }
        if let Some(secs) = self.session_timeout_secs {
            crawler.session_timeout_secs = secs;
        }
        if let Some(headless) = self.headless {
            crawler.headless = headless;
        }
        if let Some(keywords) = &self.keywords {
            anomaly.keywords.clone_from(keywords);
        }
    }
}

/// The part of the configuration a cycle reads when it starts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConfig {
    pub crawler: CrawlerConfig,
    pub anomaly: AnomalyConfig,
}

impl From<&AppConfig> for RuntimeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            crawler: config.crawler.clone(),
            anomaly: config.anomaly.clone(),
        }
    }
}

/// Runtime-mutable crawler settings shared between the scheduler and its controllers
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<RuntimeConfig>>,
}

impl SharedConfig {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current settings; later updates do not affect it
    pub async fn snapshot(&self) -> RuntimeConfig {
        self.inner.read().await.clone()
    }

    /// Apply `updater` to a copy and store it only if it still validates
    pub async fn update<F>(&self, updater: F) -> Result<RuntimeConfig, ConfigError>
    where
        F: FnOnce(&mut RuntimeConfig),
    {
        let mut guard = self.inner.write().await;
        let mut candidate = guard.clone();
        updater(&mut candidate);
        candidate.crawler.validate()?;
        *guard = candidate.clone();
        Ok(candidate)
    }
}

pub mod defaults {
    pub const TARGET_URL: &str = "http://xiao8.lodsve.com:6007/x8login";
    pub const CYCLE_INTERVAL_SECS: u64 = 50;
    pub const MAX_CONCURRENT_SESSIONS: usize = 10;
    pub const SESSION_TIMEOUT_SECS: u64 = 30;
    pub const HEADLESS: bool = true;
    pub const WEBDRIVER_URL: &str = "http://localhost:9515";
    pub const CATEGORY_LABEL: &str = "师门";
    pub const TASK_DEADLINE_SECS: u64 = 120;
    pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    pub const WINDOW_WIDTH: u32 = 1920;
    pub const WINDOW_HEIGHT: u32 = 1080;

    pub const ANOMALY_KEYWORDS: &[&str] = &["网络异常", "服务器维护", "登录失败", "掉线", "验证码"];

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_NAME: &str = "xiaoba_crawler.log";
    pub const LOG_MAX_FILES: u32 = 10;
    pub const LOG_UTC_OFFSET_HOURS: i32 = 8;

    pub const DATABASE_FILE_NAME: &str = "xiaoba_crawler.db";
    pub const DATABASE_MAX_CONNECTIONS: u32 = 5;
}

impl DatabaseConfig {
    /// Configured url, or a SQLite file under the application data dir
    pub fn resolved_url(&self) -> Result<String> {
        match &self.url {
            Some(url) => Ok(url.clone()),
            None => {
                let path = ConfigManager::get_app_data_dir()?.join(defaults::DATABASE_FILE_NAME);
                Ok(format!("sqlite:{}", path.display()))
            }
        }
    }

    pub const fn max_connections(&self) -> u32 {
        if self.max_connections == 0 {
            defaults::DATABASE_MAX_CONNECTIONS
        } else {
            self.max_connections
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crawler.cycle_interval_secs, 50);
        assert_eq!(config.crawler.max_concurrent_sessions, 10);
        assert_eq!(config.crawler.category_label.as_deref(), Some("师门"));
        assert!(!config.crawler.restore_baselines);
        assert!(config.anomaly.keywords.contains(&"网络异常".to_string()));
    }

    #[test]
    fn rejects_zero_interval_and_concurrency() {
        let mut crawler = CrawlerConfig::default();
        crawler.cycle_interval_secs = 0;
        assert!(matches!(crawler.validate(), Err(ConfigError::Validation { .. })));

        let mut crawler = CrawlerConfig::default();
        crawler.max_concurrent_sessions = 0;
        assert!(crawler.validate().is_err());

        let mut crawler = CrawlerConfig::default();
        crawler.target_url = "  ".into();
        assert!(crawler.validate().is_err());
    }

    #[test]
    fn logging_needs_an_output() {
        let logging = LoggingConfig {
            console_output: false,
            file_output: false,
            ..LoggingConfig::default()
        };
        assert!(logging.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "crawler": { "max_concurrent_sessions": 3, "headless": false } }"#)?;

        let config = AppConfig::load_with_env(Some(&path), Some(HashMap::new()))?;
        assert_eq!(config.crawler.max_concurrent_sessions, 3);
        assert!(!config.crawler.headless);
        assert_eq!(config.crawler.cycle_interval_secs, defaults::CYCLE_INTERVAL_SECS);
        assert_eq!(config.logging, LoggingConfig::default());
        Ok(())
    }

    #[test]
    fn environment_overrides_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "crawler": { "cycle_interval_secs": 90 } }"#)?;

        let env = HashMap::from([
            ("XIAOBA__CRAWLER__CYCLE_INTERVAL_SECS".to_string(), "15".to_string()),
            ("XIAOBA__ANOMALY__KEYWORDS".to_string(), "掉线,维护".to_string()),
        ]);
        let config = AppConfig::load_with_env(Some(&path), Some(env))?;
        assert_eq!(config.crawler.cycle_interval_secs, 15);
        assert_eq!(config.anomaly.keywords, vec!["掉线".to_string(), "维护".to_string()]);
        Ok(())
    }

    #[test]
    fn invalid_values_fail_validation() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "crawler": { "max_concurrent_sessions": 0 } }"#)?;
        let result = AppConfig::load_with_env(Some(&path), Some(HashMap::new()));
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn manager_creates_defaults_and_recovers_corrupt_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("config.json");
        let manager = ConfigManager::with_path(&path);

        manager.ensure_exists().await?;
        assert!(path.exists());

        std::fs::write(&path, "{ not json")?;
        manager.ensure_exists().await?;
        assert!(path.with_extension("json.corrupted").exists());
        let restored: AppConfig = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(restored, AppConfig::default());
        Ok(())
    }

    #[tokio::test]
    async fn shared_config_rejects_invalid_update() {
        let shared = SharedConfig::new(RuntimeConfig::default());
        let before = shared.snapshot().await;

        let result = shared.update(|c| c.crawler.max_concurrent_sessions = 0).await;
        assert!(result.is_err());
        assert_eq!(shared.snapshot().await, before);

        let updated = shared.update(|c| c.crawler.max_concurrent_sessions = 2).await;
        assert!(updated.is_ok());
        assert_eq!(shared.snapshot().await.crawler.max_concurrent_sessions, 2);
        // earlier snapshots are unaffected
        assert_eq!(before.crawler.max_concurrent_sessions, defaults::MAX_CONCURRENT_SESSIONS);
    }

    #[tokio::test]
    async fn update_persists_only_the_change() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "crawler": { "headless": false } }"#)?;
        let manager = ConfigManager::with_path(&path);

        let change = SettingsChange {
            cycle_interval_secs: Some(20),
            keywords: Some(vec!["掉线".into()]),
            ..SettingsChange::default()
        };
        let saved = manager
            .update_config(|c| change.apply(&mut c.crawler, &mut c.anomaly))
            .await?;
        assert_eq!(saved.crawler.cycle_interval_secs, 20);
        assert!(!saved.crawler.headless);

        let reloaded = AppConfig::load_with_env(Some(&path), Some(HashMap::new()))?;
        assert_eq!(reloaded, saved);

        let rejected = SettingsChange { max_concurrent_sessions: Some(0), ..SettingsChange::default() };
        assert!(manager.update_config(|c| rejected.apply(&mut c.crawler, &mut c.anomaly)).await.is_err());
        let unchanged = AppConfig::load_with_env(Some(&path), Some(HashMap::new()))?;
        assert_eq!(unchanged.crawler.max_concurrent_sessions, defaults::MAX_CONCURRENT_SESSIONS);
        Ok(())
    }
}
