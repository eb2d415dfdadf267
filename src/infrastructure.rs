//! Infrastructure layer: database, configuration, logging and the external
//! integrations (WebDriver, HTML table parsing, CSV export)

pub mod account_repository;
pub mod config;
pub mod database_connection;
pub mod export;
pub mod keyword_stat_repository;
pub mod logging;
pub mod record_repository;
pub mod table_extractor;
pub mod webdriver;

pub use account_repository::SqliteAccountRepository;
pub use config::{AppConfig, ConfigManager, RuntimeConfig, SettingsChange, SharedConfig};
pub use database_connection::DatabaseConnection;
pub use keyword_stat_repository::SqliteKeywordStatRepository;
pub use logging::{get_log_directory, init_logging_with_config, log_system_info};
pub use record_repository::SqliteRecordRepository;
pub use table_extractor::TableExtractor;
pub use webdriver::{WebDriverLauncher, WebDriverSession};
