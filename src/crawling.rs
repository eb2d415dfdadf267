//! Crawling module
//!
//! Browser sessions, the login state machine and the orchestrator that runs
//! one isolated task per account on every cycle.
//!
//! - `browser`: capability traits the rest of the module is written against
//! - `locator` / `session_driver`: finding controls and signing in
//! - `registry`: per-account accumulation state
//! - `gateway` / `notifier`: persistence and live fanout
//! - `orchestrator`: scheduling, bounded concurrency and isolation

pub mod browser;
pub mod error;
pub mod gateway;
pub mod locator;
pub mod notifier;
pub mod orchestrator;
pub mod registry;
pub mod session_driver;
pub mod snapshots;

pub use browser::{BrowserDriver, BrowserLauncher, By, DriverError, ElementHandle, SessionOptions};
pub use error::{CrawlError, CrawlErrorKind};
pub use gateway::{PersistenceGateway, PublishReport};
pub use locator::ElementLocator;
pub use notifier::{CrawlerUpdate, NotificationHub, Subscription};
pub use orchestrator::{AccountOutcome, AccountReport, CrawlOrchestrator, CrawlerStatus, CycleReport, OrchestratorError};
pub use registry::AccountRegistry;
pub use session_driver::{DriverTimings, LoginSettings, LoginState, SessionDriver};
pub use snapshots::SnapshotRecorder;
