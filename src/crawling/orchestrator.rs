//! # Crawl Orchestrator
//!
//! Schedules periodic cycles and fans out one isolated task per enabled
//! account. Within a task the order is strictly
//! launch -> login -> extract -> accumulate -> persist -> notify -> release.
//!
//! - concurrency is bounded by a semaphore sized from `max_concurrent_sessions`
//! - an account whose previous task still holds its engine lock is skipped
//! - each task runs under an overall deadline and is isolated from panics
//! - the browser session is released whatever the outcome

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crawling::browser::{BrowserDriver, BrowserLauncher, SessionOptions};
use crate::crawling::error::{CrawlError, CrawlErrorKind};
use crate::crawling::gateway::PersistenceGateway;
use crate::crawling::registry::{AccountRegistry, EngineGuard};
use crate::crawling::session_driver::{DriverTimings, LoginSettings, SessionDriver};
use crate::crawling::snapshots::SnapshotRecorder;
use crate::domain::account::{AccountCredential, AccountStatus};
use crate::domain::accumulation::{AccumulationEngine, KeywordScanner};
use crate::domain::repositories::AccountRepository;
use crate::infrastructure::config::{RuntimeConfig, SharedConfig};
use crate::infrastructure::table_extractor::TableExtractor;

/// Upper bound on closing a browser session after its task ends
const SESSION_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time `stop()` waits for in-flight cycles to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Account '{0}' does not exist")]
    AccountNotFound(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Timed out waiting for running cycles to stop")]
    ShutdownTimeout,
}

impl OrchestratorError {
    fn repository(e: &anyhow::Error) -> Self {
        Self::Repository(format!("{e:#}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccountOutcome {
    Succeeded {
        records: usize,
        persistence_failures: usize,
        delivered: usize,
    },
    Failed {
        kind: CrawlErrorKind,
        message: String,
    },
    /// Signed in, but the table held no usable rows; account status is left as it was
    NoData,
    /// Previous task for the account was still running
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountReport {
    pub account: String,
    #[serde(flatten)]
    pub outcome: AccountOutcome,
    pub elapsed_ms: u64,
}

impl AccountReport {
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, AccountOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub accounts: Vec<AccountReport>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.accounts.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.accounts
            .iter()
            .filter(|r| matches!(r.outcome, AccountOutcome::Failed { .. }))
            .count()
    }

    pub fn no_data(&self) -> usize {
        self.accounts
            .iter()
            .filter(|r| r.outcome == AccountOutcome::NoData)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.accounts
            .iter()
            .filter(|r| r.outcome == AccountOutcome::Skipped)
            .count()
    }

    pub fn report_for(&self, account: &str) -> Option<&AccountReport> {
        self.accounts.iter().find(|r| r.account == account)
    }
}

/// Summary for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlerStatus {
    pub total_accounts: u64,
    pub active_accounts: u64,
    pub total_records: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Why a task ended without success
enum TaskFailure {
    Crawl(CrawlError),
    Panicked(String),
}

impl TaskFailure {
    fn outcome(&self) -> AccountOutcome {
        match self {
            Self::Crawl(e) => AccountOutcome::Failed {
                kind: e.kind(),
                message: e.to_string(),
            },
            Self::Panicked(message) => AccountOutcome::Failed {
                kind: CrawlErrorKind::Panicked,
                message: message.clone(),
            },
        }
    }
}

struct TaskSuccess {
    records: usize,
    persistence_failures: usize,
    delivered: usize,
}

type SessionSlot = Arc<Mutex<Option<Arc<dyn BrowserDriver>>>>;

#[derive(Clone)]
pub struct CrawlOrchestrator {
    config: SharedConfig,
    launcher: Arc<dyn BrowserLauncher>,
    accounts: Arc<dyn AccountRepository>,
    gateway: PersistenceGateway,
    registry: AccountRegistry,
    extractor: Arc<TableExtractor>,
    timings: DriverTimings,
    /// Current permit pool and the size it was created with
    semaphore: Arc<Mutex<(usize, Arc<Semaphore>)>>,
    cancellation: Arc<Mutex<CancellationToken>>,
    scheduler: Arc<Mutex<Option<JoinHandle<()>>>>,
    last_cycle_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl CrawlOrchestrator {
    pub fn new(
        config: SharedConfig,
        launcher: Arc<dyn BrowserLauncher>,
        accounts: Arc<dyn AccountRepository>,
        gateway: PersistenceGateway,
    ) -> Result<Self, OrchestratorError> {
        let extractor = TableExtractor::new().map_err(|e| OrchestratorError::Initialization(e.to_string()))?;
        Ok(Self {
            config,
            launcher,
            accounts,
            gateway,
            registry: AccountRegistry::new(),
            extractor: Arc::new(extractor),
            timings: DriverTimings::default(),
            semaphore: Arc::new(Mutex::new((0, Arc::new(Semaphore::new(0))))),
            cancellation: Arc::new(Mutex::new(CancellationToken::new())),
            scheduler: Arc::new(Mutex::new(None)),
            last_cycle_at: Arc::new(Mutex::new(None)),
        })
    }

    /// Override login/extraction waits; the page-load wait still follows the session timeout
    #[must_use]
    pub fn with_timings(mut self, timings: DriverTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Seed accumulation baselines from the stored snapshot when enabled in config
    pub async fn restore_baselines(&self) -> Result<usize, OrchestratorError> {
        let snapshot = self.config.snapshot().await;
        if !snapshot.crawler.restore_baselines {
            return Ok(0);
        }

        let scanner = KeywordScanner::new(snapshot.anomaly.keywords.iter().cloned());
        let mut restored = 0;
        for account in self.accounts.find_all().await.map_err(|e| OrchestratorError::repository(&e))? {
            let records = self
                .gateway
                .records()
                .find_all(Some(&account.username))
                .await
                .map_err(|e| OrchestratorError::repository(&e))?;
            let count = records.len();
            if self.registry.restore(&account.username, &scanner, records) {
                debug!(account = %account.username, records = count, "baseline restored");
                restored += 1;
            }
        }
        info!(accounts = restored, "accumulation baselines restored");
        Ok(restored)
    }

    /// Run one cycle over every enabled account and wait for it to finish
    pub async fn run_cycle(&self) -> Result<CycleReport, OrchestratorError> {
        let started_at = Utc::now();
        let snapshot = Arc::new(self.config.snapshot().await);
        let accounts = self
            .accounts
            .find_enabled()
            .await
            .map_err(|e| OrchestratorError::repository(&e))?;

        info!(accounts = accounts.len(), "crawl cycle started");
        let semaphore = self.semaphore_for(snapshot.crawler.max_concurrent_sessions);
        let cancel = self.current_token();
        let scanner = KeywordScanner::new(snapshot.anomaly.keywords.iter().cloned());

        let mut reports = Vec::with_capacity(accounts.len());
        let mut tasks = JoinSet::new();
        for account in accounts {
            let Some(engine) = self.registry.try_acquire(&account.username, &scanner) else {
                info!(account = %account.username, "previous task still running, skipping");
                reports.push(AccountReport {
                    account: account.username,
                    outcome: AccountOutcome::Skipped,
                    elapsed_ms: 0,
                });
                continue;
            };

            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let snapshot = Arc::clone(&snapshot);
            let cancel = cancel.clone();
            tasks.spawn(async move { this.run_account(account, engine, semaphore, snapshot, cancel).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "account task aborted"),
            }
        }

        reports.sort_by(|a, b| a.account.cmp(&b.account));
        let report = CycleReport {
            started_at,
            finished_at: Utc::now(),
            accounts: reports,
        };
        *self.last_cycle_at.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(report.finished_at);

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            no_data = report.no_data(),
            skipped = report.skipped(),
            "crawl cycle finished"
        );
        Ok(report)
    }

    /// One-off crawl of a single account outside the schedule; ignores the enabled flag
    pub async fn test_account(&self, username: &str) -> Result<AccountReport, OrchestratorError> {
        let account = self
            .accounts
            .find_by_username(username)
            .await
            .map_err(|e| OrchestratorError::repository(&e))?
            .ok_or_else(|| OrchestratorError::AccountNotFound(username.to_string()))?;

        let snapshot = Arc::new(self.config.snapshot().await);
        let scanner = KeywordScanner::new(snapshot.anomaly.keywords.iter().cloned());
        let Some(engine) = self.registry.try_acquire(username, &scanner) else {
            info!(account = username, "account busy, test skipped");
            return Ok(AccountReport {
                account: account.username,
                outcome: AccountOutcome::Skipped,
                elapsed_ms: 0,
            });
        };

        let semaphore = self.semaphore_for(snapshot.crawler.max_concurrent_sessions);
        let cancel = self.current_token();
        Ok(self.clone().run_account(account, engine, semaphore, snapshot, cancel).await)
    }

    /// Start the periodic scheduler in the background
    pub fn start(&self) -> Result<(), OrchestratorError> {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if scheduler.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(OrchestratorError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *self.cancellation.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = token.clone();

        let this = self.clone();
        *scheduler = Some(tokio::spawn(async move { this.schedule(token).await }));
        info!("crawl scheduler started");
        Ok(())
    }

    /// Cancel the scheduler and every running task, then wait for sessions to close
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(OrchestratorError::NotRunning)?;

        info!("stopping crawl scheduler");
        // Tasks already running hold the old token; later on-demand cycles get a live one
        let stopped = std::mem::replace(
            &mut *self.cancellation.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            CancellationToken::new(),
        );
        stopped.cancel();

        let abort = handle.abort_handle();
        match timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(_) => {
                info!("crawl scheduler stopped");
                Ok(())
            }
            Err(_) => {
                abort.abort();
                Err(OrchestratorError::ShutdownTimeout)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn status(&self) -> Result<CrawlerStatus, OrchestratorError> {
        let repo = |e: anyhow::Error| OrchestratorError::repository(&e);
        let by_status = self.accounts.count_by_status().await.map_err(repo)?;
        Ok(CrawlerStatus {
            total_accounts: self.accounts.count().await.map_err(repo)?,
            active_accounts: by_status.get(&AccountStatus::Active).copied().unwrap_or_default(),
            total_records: self.gateway.records().count().await.map_err(repo)?,
            last_update: self.gateway.records().latest_observation().await.map_err(repo)?,
            last_cycle_at: *self.last_cycle_at.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            running: self.is_running(),
        })
    }

    /// Fixed-rate trigger loop; a slow cycle never delays the next trigger
    async fn schedule(self, token: CancellationToken) {
        let mut cycles = JoinSet::new();
        let mut next_tick = Instant::now();

        loop {
            let this = self.clone();
            cycles.spawn(async move { this.run_cycle().await });

            let interval = self.config.snapshot().await.crawler.cycle_interval();
            next_tick += interval;

            tokio::select! {
                () = token.cancelled() => {
                    debug!("scheduler received cancellation");
                    break;
                }
                () = sleep_until(next_tick) => {}
            }

            while let Some(finished) = cycles.try_join_next() {
                log_cycle_result(finished);
            }
        }

        while let Some(finished) = cycles.join_next().await {
            log_cycle_result(finished);
        }
    }

    /// Permit pool for this cycle, rebuilt when the configured size changed
    fn semaphore_for(&self, size: usize) -> Arc<Semaphore> {
        let mut current = self.semaphore.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if current.0 != size {
            debug!(from = current.0, to = size, "resizing session pool");
            *current = (size, Arc::new(Semaphore::new(size)));
        }
        Arc::clone(&current.1)
    }

    fn current_token(&self) -> CancellationToken {
        self.cancellation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Task boundary: every failure is turned into a report here
    async fn run_account(
        self,
        account: AccountCredential,
        mut engine: EngineGuard,
        semaphore: Arc<Semaphore>,
        snapshot: Arc<RuntimeConfig>,
        cancel: CancellationToken,
    ) -> AccountReport {
        let started = Instant::now();
        let username = account.username.clone();
        let slot: SessionSlot = Arc::new(Mutex::new(None));

        let result = tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(_permit) => {
                    let deadline = snapshot.crawler.task_deadline();
                    let work = self.crawl_account(&account, &mut engine, &snapshot, &slot);
                    tokio::select! {
                        finished = timeout(deadline, AssertUnwindSafe(work).catch_unwind()) => match finished {
                            Ok(Ok(result)) => result.map_err(TaskFailure::Crawl),
                            Ok(Err(panic)) => Err(TaskFailure::Panicked(panic_message(panic.as_ref()))),
                            Err(_) => Err(TaskFailure::Crawl(CrawlError::Deadline(deadline))),
                        },
                        () = cancel.cancelled() => Err(TaskFailure::Crawl(CrawlError::Cancelled)),
                    }
                }
                Err(_) => Err(TaskFailure::Crawl(CrawlError::Cancelled)),
            },
            () = cancel.cancelled() => Err(TaskFailure::Crawl(CrawlError::Cancelled)),
        };

        self.release_session(&username, &slot).await;

        let outcome = match result {
            Ok(success) if success.records == 0 => {
                warn!(account = %username, "signed in but the report table had no rows");
                AccountOutcome::NoData
            }
            Ok(success) => {
                if let Err(e) = self
                    .accounts
                    .record_outcome(&username, AccountStatus::Active, Some(Utc::now()))
                    .await
                {
                    warn!(account = %username, error = %e, "could not store account status");
                }
                info!(account = %username, records = success.records, "account crawl succeeded");
                AccountOutcome::Succeeded {
                    records: success.records,
                    persistence_failures: success.persistence_failures,
                    delivered: success.delivered,
                }
            }
            Err(failure) => {
                let outcome = failure.outcome();
                let cancelled = matches!(failure, TaskFailure::Crawl(CrawlError::Cancelled));
                if cancelled {
                    info!(account = %username, "account task cancelled");
                } else {
                    if let AccountOutcome::Failed { kind, message } = &outcome {
                        error!(account = %username, ?kind, error = %message, "account crawl failed");
                    }
                    if let Err(e) = self.accounts.record_outcome(&username, AccountStatus::Error, None).await {
                        warn!(account = %username, error = %e, "could not store account status");
                    }
                }
                outcome
            }
        };

        AccountReport {
            account: username,
            outcome,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn crawl_account(
        &self,
        account: &AccountCredential,
        engine: &mut AccumulationEngine,
        snapshot: &RuntimeConfig,
        slot: &SessionSlot,
    ) -> Result<TaskSuccess, CrawlError> {
        let crawler = &snapshot.crawler;
        let options = SessionOptions {
            account: account.username.clone(),
            headless: crawler.headless,
            page_load_timeout: crawler.session_timeout(),
            window_size: (crawler.window_width, crawler.window_height),
            user_agent: crawler.user_agent.clone(),
        };

        let driver = self
            .launcher
            .launch(&options)
            .await
            .map_err(CrawlError::SessionLaunch)?;
        *slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::clone(&driver));

        let settings = LoginSettings {
            target_url: crawler.target_url.clone(),
            category_label: crawler.category_label.clone(),
            timings: DriverTimings {
                page_load: crawler.session_timeout(),
                ..self.timings
            },
            snapshots: SnapshotRecorder::new(crawler.snapshot_dir.clone()),
        };
        let mut session = SessionDriver::new(driver, &account.username, &account.secret, settings);
        let markup = session.fetch_report().await?;

        let rows = self.extractor.extract(&account.username, &markup);
        engine.set_scanner(KeywordScanner::new(snapshot.anomaly.keywords.iter().cloned()));
        let records = engine.observe_all(rows, Utc::now());
        let count = records.len();

        let report = self.gateway.publish(&account.username, records).await;
        Ok(TaskSuccess {
            records: count,
            persistence_failures: report.failed,
            delivered: report.delivered,
        })
    }

    async fn release_session(&self, username: &str, slot: &SessionSlot) {
        let driver = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        let Some(driver) = driver else {
            return;
        };
        match timeout(SESSION_RELEASE_TIMEOUT, driver.quit()).await {
            Ok(Ok(())) => debug!(account = username, "browser session closed"),
            Ok(Err(e)) => warn!(account = username, error = %e, "browser session did not close cleanly"),
            Err(_) => warn!(account = username, "browser session close timed out"),
        }
    }
}

fn log_cycle_result(finished: Result<Result<CycleReport, OrchestratorError>, tokio::task::JoinError>) {
    match finished {
        Ok(Ok(report)) => debug!(accounts = report.accounts.len(), "scheduled cycle completed"),
        Ok(Err(e)) => error!(error = %e, "scheduled cycle failed"),
        Err(e) => error!(error = %e, "scheduled cycle aborted"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "task panicked");
    }

    #[test]
    fn cycle_report_counts_outcomes() {
        let report = CycleReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            accounts: vec![
                AccountReport {
                    account: "a".into(),
                    outcome: AccountOutcome::Succeeded { records: 2, persistence_failures: 0, delivered: 0 },
                    elapsed_ms: 1,
                },
                AccountReport {
                    account: "b".into(),
                    outcome: AccountOutcome::Failed { kind: CrawlErrorKind::LoginTimeout, message: String::new() },
                    elapsed_ms: 1,
                },
                AccountReport { account: "c".into(), outcome: AccountOutcome::Skipped, elapsed_ms: 0 },
                AccountReport { account: "d".into(), outcome: AccountOutcome::NoData, elapsed_ms: 3 },
            ],
        };
        assert_eq!((report.succeeded(), report.failed(), report.skipped(), report.no_data()), (1, 1, 1, 1));
        assert!(report.report_for("d").is_some_and(|r| !r.is_success()));
        assert!(report.report_for("b").is_some_and(|r| !r.is_success()));
    }

    #[test]
    fn account_report_serializes_flat() -> anyhow::Result<()> {
        let report = AccountReport {
            account: "KR666".into(),
            outcome: AccountOutcome::Failed { kind: CrawlErrorKind::Deadline, message: "late".into() },
            elapsed_ms: 5,
        };
        let json = serde_json::to_value(&report)?;
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "deadline");
        assert_eq!(json["account"], "KR666");
        Ok(())
    }
}
