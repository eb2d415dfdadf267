//! Test utilities for the crawler
//!
//! Provides an in-memory database with every repository wired up, plus a
//! scripted browser that plays a small login site so the login flow and the
//! orchestrator can be exercised without a real WebDriver endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::crawling::browser::{
    BrowserDriver, BrowserLauncher, By, DriverError, DriverResult, ElementHandle, SessionOptions,
};
use crate::crawling::gateway::PersistenceGateway;
use crate::crawling::locator::selectors;
use crate::crawling::notifier::NotificationHub;
use crate::crawling::orchestrator::CrawlOrchestrator;
use crate::crawling::session_driver::DriverTimings;
use crate::domain::account::AccountCredential;
use crate::domain::repositories::AccountRepository;
use crate::infrastructure::config::{AnomalyConfig, CrawlerConfig, RuntimeConfig, SharedConfig};
use crate::infrastructure::{
    DatabaseConnection, SqliteAccountRepository, SqliteKeywordStatRepository, SqliteRecordRepository,
};

pub const TARGET_URL: &str = "http://xiao8.test/x8login";
pub const DASHBOARD_URL: &str = "http://xiao8.test/x8main";
pub const CATEGORY_LABEL: &str = "师门";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Test database with every repository on one in-memory pool
pub struct TestDatabase {
    pub connection: DatabaseConnection,
    pub accounts: Arc<SqliteAccountRepository>,
    pub records: Arc<SqliteRecordRepository>,
    pub keyword_stats: Arc<SqliteKeywordStatRepository>,
}

impl TestDatabase {
    /// Fresh, migrated in-memory database; tests never share state
    pub async fn new() -> Result<Self> {
        let connection = DatabaseConnection::new("sqlite::memory:").await?;
        connection.migrate().await?;
        let pool = connection.pool().clone();
        Ok(Self {
            accounts: Arc::new(SqliteAccountRepository::new(pool.clone())),
            records: Arc::new(SqliteRecordRepository::new(pool.clone())),
            keyword_stats: Arc::new(SqliteKeywordStatRepository::new(pool)),
            connection,
        })
    }

    pub fn pool(&self) -> sqlx::Pool<sqlx::Sqlite> {
        self.connection.pool().clone()
    }

    pub fn gateway(&self, hub: NotificationHub) -> PersistenceGateway {
        PersistenceGateway::new(self.records.clone(), self.keyword_stats.clone(), hub)
    }

    pub async fn add_account(&self, username: &str, secret: &str) -> Result<AccountCredential> {
        let account = AccountCredential::new(username, secret);
        self.accounts.create(&account).await?;
        Ok(account)
    }
}

/// Orchestrator over a scripted launcher and an in-memory database
pub struct TestContext {
    pub database: TestDatabase,
    pub hub: NotificationHub,
    pub launcher: Arc<ScriptedLauncher>,
    pub config: SharedConfig,
    pub orchestrator: CrawlOrchestrator,
}

impl TestContext {
    pub async fn new(launcher: ScriptedLauncher) -> Result<Self> {
        Self::with_config(launcher, test_runtime_config()).await
    }

    pub async fn with_config(launcher: ScriptedLauncher, config: RuntimeConfig) -> Result<Self> {
        let database = TestDatabase::new().await?;
        let hub = NotificationHub::new();
        let launcher = Arc::new(launcher);
        let config = SharedConfig::new(config);
        let orchestrator = CrawlOrchestrator::new(
            config.clone(),
            launcher.clone(),
            database.accounts.clone(),
            database.gateway(hub.clone()),
        )?
        .with_timings(fast_timings());
        Ok(Self {
            database,
            hub,
            launcher,
            config,
            orchestrator,
        })
    }

    pub async fn add_accounts(&self, usernames: &[&str]) -> Result<()> {
        for username in usernames {
            self.database.add_account(username, "secret").await?;
        }
        Ok(())
    }
}

/// Short waits for tests on the real clock; SQLite work runs off the runtime, so database tests never pause time
pub fn fast_timings() -> DriverTimings {
    DriverTimings {
        page_load: Duration::from_secs(1),
        category_waits: [Duration::from_millis(50); 3],
        form_wait: Duration::from_millis(200),
        login_wait: Duration::from_millis(300),
        table_wait: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
    }
}

/// Crawler settings pointing at the scripted site
pub fn test_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        crawler: CrawlerConfig {
            target_url: TARGET_URL.to_string(),
            category_label: Some(CATEGORY_LABEL.to_string()),
            snapshot_dir: None,
            ..CrawlerConfig::default()
        },
        anomaly: AnomalyConfig::default(),
    }
}

/// Report page with `rows` ordinary data rows
pub fn dashboard_html(rows: usize) -> String {
    let rows: Vec<(i64, i64, &str)> = (1..=rows)
        .map(|i| {
            let i = i64::try_from(i).unwrap_or(i64::MAX);
            (i, i, "正常")
        })
        .collect();
    dashboard_html_with(&rows)
}

/// Report page with one row per `(sequence, current count, status text)`
pub fn dashboard_html_with(rows: &[(i64, i64, &str)]) -> String {
    let header = "<tr><th>序号</th><th>IP</th><th>类型</th><th>命名</th><th>等级</th><th>门派</th>\
                  <th>绝技</th><th>次数</th><th>总时间</th><th>状态</th><th>运行时间</th></tr>";
    let body: String = rows
        .iter()
        .map(|(sequence, current, status)| {
            format!(
                "<tr><td>{sequence}</td><td>10.0.0.{sequence}</td><td>师门</td><td>角色{sequence}</td>\
                 <td>{level}</td><td>天策</td><td>破军</td><td>{current}/20</td><td>01:30:00</td>\
                 <td>{status}</td><td>02:00:00</td></tr>",
                level = sequence * 10,
            )
        })
        .collect();
    format!("<html><body><h1>小八</h1><table>{header}{body}</table></body></html>")
}

/// What clicking a fake element does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClickAction {
    #[default]
    Nothing,
    SubmitLogin,
}

/// One element of a scripted page
#[derive(Debug, Clone)]
pub struct FakeElement {
    pub tag: String,
    pub text: String,
    pub attributes: HashMap<String, String>,
    pub clickable: bool,
    /// Css/XPath locators this element answers to
    pub locators: Vec<By>,
    pub on_click: ClickAction,
}

impl FakeElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            text: String::new(),
            attributes: HashMap::new(),
            clickable: true,
            locators: Vec::new(),
            on_click: ClickAction::Nothing,
        }
    }

    #[must_use]
    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    #[must_use]
    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub const fn clickable(mut self, clickable: bool) -> Self {
        self.clickable = clickable;
        self
    }

    #[must_use]
    pub fn matching(mut self, by: By) -> Self {
        self.locators.push(by);
        self
    }

    #[must_use]
    pub const fn on_click(mut self, action: ClickAction) -> Self {
        self.on_click = action;
        self
    }

    /// Name and tag lookups work on any element; the rest must be registered
    fn answers(&self, by: &By) -> bool {
        match by {
            By::Name(name) => self.attributes.get("name") == Some(name),
            By::TagName(tag) => self.tag.eq_ignore_ascii_case(tag),
            other => self.locators.contains(other),
        }
    }
}

/// Behaviour of the scripted login site
#[derive(Debug, Clone)]
pub struct LoginSite {
    pub dashboard: String,
    /// Required password; `None` accepts any
    pub password: Option<String>,
    category: bool,
    form: bool,
    submit: bool,
    ready: bool,
    accepts: bool,
    delay: Duration,
}

impl LoginSite {
    /// Category button, username/password inputs and a submit button
    pub fn standard(dashboard: String) -> Self {
        Self {
            dashboard,
            password: None,
            category: true,
            form: true,
            submit: true,
            ready: true,
            accepts: true,
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn without_category(mut self) -> Self {
        self.category = false;
        self
    }

    #[must_use]
    pub fn without_form(mut self) -> Self {
        self.form = false;
        self
    }

    #[must_use]
    pub fn without_submit(mut self) -> Self {
        self.submit = false;
        self
    }

    /// Document never reaches `complete`
    #[must_use]
    pub fn never_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Submitting leaves the browser on the login page
    #[must_use]
    pub fn rejecting_password(mut self) -> Self {
        self.accepts = false;
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Latency added to navigation and to the post-submit redirect
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn login_page(&self) -> Vec<FakeElement> {
        let mut elements = Vec::new();
        if self.category {
            elements.push(
                FakeElement::new("button")
                    .text(CATEGORY_LABEL)
                    .matching(selectors::exact_text(CATEGORY_LABEL)),
            );
        }
        if self.form {
            elements.push(FakeElement::new("input").attr("type", "text").attr("name", "username"));
            elements.push(FakeElement::new("input").attr("type", "password").attr("name", "password"));
        }
        if self.submit {
            elements.push(
                FakeElement::new("button")
                    .attr("type", "submit")
                    .text("登录")
                    .matching(selectors::submit_by_type())
                    .on_click(ClickAction::SubmitLogin),
            );
        }
        elements
    }

    fn dashboard_page(&self) -> Vec<FakeElement> {
        if self.dashboard.contains("<table") {
            vec![FakeElement::new("table")]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Page {
    Login,
    Dashboard,
}

struct BrowserState {
    url: String,
    page: Page,
    /// Bumped on every page change so old handles go stale
    generation: u64,
    elements: Vec<FakeElement>,
    typed: HashMap<String, String>,
    lookups: HashMap<By, usize>,
}

/// Session counters shared by every browser a launcher creates
#[derive(Debug, Default)]
pub struct SessionProbe {
    open: AtomicUsize,
    peak: AtomicUsize,
    launched: AtomicUsize,
    closed: AtomicUsize,
}

impl SessionProbe {
    fn opened(&self) {
        self.launched.fetch_add(1, Ordering::SeqCst);
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn released(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Most sessions ever open at the same time
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-process [`BrowserDriver`] backed by a list of fake elements
pub struct ScriptedBrowser {
    site: Option<LoginSite>,
    probe: Option<Arc<SessionProbe>>,
    state: Mutex<BrowserState>,
    closed: AtomicBool,
    fail_lookups: AtomicBool,
    fail_screenshots: AtomicBool,
    fail_native_clicks: AtomicBool,
    script_clicks: AtomicUsize,
}

impl ScriptedBrowser {
    /// Static page made of `elements`
    pub fn with_elements(elements: Vec<FakeElement>) -> Self {
        Self::build(None, None, Page::Login, elements)
    }

    /// Blank browser that serves `site` once it navigates
    pub fn for_site(site: LoginSite) -> Self {
        Self::build(Some(site), None, Page::Login, Vec::new())
    }

    pub fn for_site_with_probe(site: LoginSite, probe: Arc<SessionProbe>) -> Self {
        Self::build(Some(site), Some(probe), Page::Login, Vec::new())
    }

    fn build(site: Option<LoginSite>, probe: Option<Arc<SessionProbe>>, page: Page, elements: Vec<FakeElement>) -> Self {
        Self {
            site,
            probe,
            state: Mutex::new(BrowserState {
                url: "about:blank".to_string(),
                page,
                generation: 1,
                elements,
                typed: HashMap::new(),
                lookups: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
            fail_lookups: AtomicBool::new(false),
            fail_screenshots: AtomicBool::new(false),
            fail_native_clicks: AtomicBool::new(false),
            script_clicks: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrowserState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Position of the element a handle refers to on the current page
    pub fn element_index(&self, handle: &ElementHandle) -> Option<usize> {
        let state = self.state();
        let (generation, index) = handle.id.split_once(':')?;
        let index: usize = index.parse().ok()?;
        (generation.parse::<u64>().ok()? == state.generation && index < state.elements.len()).then_some(index)
    }

    /// How many times `by` was looked up
    pub fn lookups(&self, by: &By) -> usize {
        self.state().lookups.get(by).copied().unwrap_or_default()
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_screenshots(&self, fail: bool) {
        self.fail_screenshots.store(fail, Ordering::SeqCst);
    }

    pub fn fail_native_clicks(&self, fail: bool) {
        self.fail_native_clicks.store(fail, Ordering::SeqCst);
    }

    pub fn script_clicks(&self) -> usize {
        self.script_clicks.load(Ordering::SeqCst)
    }

    /// Text typed into the input with this `name`
    pub fn typed_value(&self, field: &str) -> Option<String> {
        self.state().typed.get(field).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn delay(&self) -> Duration {
        self.site.as_ref().map_or(Duration::ZERO, |site| site.delay)
    }

    fn handle(generation: u64, index: usize) -> ElementHandle {
        ElementHandle::new(format!("{generation}:{index}"))
    }

    fn element(&self, handle: &ElementHandle) -> DriverResult<FakeElement> {
        let index = self
            .element_index(handle)
            .ok_or_else(|| DriverError::StaleElement(handle.id.clone()))?;
        Ok(self.state().elements[index].clone())
    }

    fn field_key(element: &FakeElement, handle: &ElementHandle) -> String {
        element
            .attributes
            .get("name")
            .cloned()
            .unwrap_or_else(|| handle.id.clone())
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.is_closed() {
            Err(DriverError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn show(&self, page: Page, url: &str, elements: Vec<FakeElement>) {
        let mut state = self.state();
        state.page = page;
        state.url = url.to_string();
        state.generation += 1;
        state.elements = elements;
        if page == Page::Login {
            state.typed.clear();
        }
    }

    async fn perform_click(&self, handle: &ElementHandle) -> DriverResult<()> {
        let element = self.element(handle)?;
        if element.on_click != ClickAction::SubmitLogin {
            return Ok(());
        }
        let Some(site) = &self.site else {
            return Ok(());
        };

        let password_ok = site
            .password
            .as_ref()
            .is_none_or(|expected| self.typed_value("password").as_ref() == Some(expected));
        if site.accepts && password_ok {
            tokio::time::sleep(site.delay).await;
            self.show(Page::Dashboard, DASHBOARD_URL, site.dashboard_page());
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for ScriptedBrowser {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        self.ensure_open()?;
        tokio::time::sleep(self.delay()).await;
        let elements = match &self.site {
            Some(site) => site.login_page(),
            None => self.state().elements.clone(),
        };
        self.show(Page::Login, url, elements);
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        self.ensure_open()?;
        Ok(self.state().url.clone())
    }

    async fn ready_state(&self) -> DriverResult<String> {
        self.ensure_open()?;
        let ready = self.site.as_ref().is_none_or(|site| site.ready);
        Ok(if ready { "complete" } else { "loading" }.to_string())
    }

    async fn find_elements(&self, by: &By) -> DriverResult<Vec<ElementHandle>> {
        self.ensure_open()?;
        let mut state = self.state();
        *state.lookups.entry(by.clone()).or_default() += 1;
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DriverError::Transport("lookup failed".into()));
        }
        let generation = state.generation;
        Ok(state
            .elements
            .iter()
            .enumerate()
            .filter(|(_, element)| element.answers(by))
            .map(|(index, _)| Self::handle(generation, index))
            .collect())
    }

    async fn find_elements_by_script(&self, _script: &str, args: Vec<Value>) -> DriverResult<Vec<ElementHandle>> {
        self.ensure_open()?;
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DriverError::Transport("script failed".into()));
        }
        let needle = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
        let state = self.state();
        Ok(state
            .elements
            .iter()
            .enumerate()
            .filter(|(_, element)| {
                element.text.contains(&needle)
                    || element.attributes.get("value").is_some_and(|v| v.contains(&needle))
            })
            .map(|(index, _)| Self::handle(state.generation, index))
            .collect())
    }

    async fn element_text(&self, element: &ElementHandle) -> DriverResult<String> {
        Ok(self.element(element)?.text)
    }

    async fn element_attribute(&self, element: &ElementHandle, name: &str) -> DriverResult<Option<String>> {
        let fake = self.element(element)?;
        if name == "value" {
            if let Some(typed) = self.state().typed.get(&Self::field_key(&fake, element)) {
                return Ok(Some(typed.clone()));
            }
        }
        Ok(fake.attributes.get(name).cloned())
    }

    async fn element_tag(&self, element: &ElementHandle) -> DriverResult<String> {
        Ok(self.element(element)?.tag)
    }

    async fn is_clickable(&self, element: &ElementHandle) -> DriverResult<bool> {
        Ok(self.element(element)?.clickable)
    }

    async fn click(&self, element: &ElementHandle) -> DriverResult<()> {
        self.ensure_open()?;
        if self.fail_native_clicks.load(Ordering::SeqCst) {
            return Err(DriverError::Command("element click intercepted".into()));
        }
        self.perform_click(element).await
    }

    async fn clear(&self, element: &ElementHandle) -> DriverResult<()> {
        let fake = self.element(element)?;
        self.state().typed.remove(&Self::field_key(&fake, element));
        Ok(())
    }

    async fn send_keys(&self, element: &ElementHandle, text: &str) -> DriverResult<()> {
        let fake = self.element(element)?;
        self.state()
            .typed
            .entry(Self::field_key(&fake, element))
            .or_default()
            .push_str(text);
        Ok(())
    }

    async fn execute_script(&self, script: &str, args: Vec<Value>) -> DriverResult<Value> {
        self.ensure_open()?;
        if script.contains(".click()") {
            let handle = args
                .first()
                .and_then(ElementHandle::from_reference)
                .ok_or_else(|| DriverError::Command("click script needs an element".into()))?;
            self.script_clicks.fetch_add(1, Ordering::SeqCst);
            self.perform_click(&handle).await?;
        }
        Ok(Value::Null)
    }

    async fn page_source(&self) -> DriverResult<String> {
        self.ensure_open()?;
        let page = self.state().page;
        Ok(match (page, &self.site) {
            (Page::Dashboard, Some(site)) => site.dashboard.clone(),
            _ => "<html><body><form id=\"login\"></form></body></html>".to_string(),
        })
    }

    async fn screenshot(&self) -> DriverResult<Vec<u8>> {
        self.ensure_open()?;
        if self.fail_screenshots.load(Ordering::SeqCst) {
            return Err(DriverError::Command("screenshot failed".into()));
        }
        Ok(PNG_SIGNATURE.to_vec())
    }

    async fn quit(&self) -> DriverResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(probe) = &self.probe {
                probe.released();
            }
        }
        Ok(())
    }
}

/// [`BrowserLauncher`] that serves scripted sites per account
pub struct ScriptedLauncher {
    default_site: LoginSite,
    sites: Mutex<HashMap<String, LoginSite>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    launches: Mutex<Vec<SessionOptions>>,
    probe: Arc<SessionProbe>,
}

impl ScriptedLauncher {
    pub fn new(default_site: LoginSite) -> Self {
        Self {
            default_site,
            sites: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            panicking: Mutex::new(HashSet::new()),
            launches: Mutex::new(Vec::new()),
            probe: Arc::new(SessionProbe::default()),
        }
    }

    /// Site served to one account from its next launch on
    pub fn set_site(&self, account: &str, site: LoginSite) {
        self.sites
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(account.to_string(), site);
    }

    pub fn fail_launch(&self, account: &str) {
        self.failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(account.to_string());
    }

    pub fn panic_on_launch(&self, account: &str) {
        self.panicking
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(account.to_string());
    }

    pub fn probe(&self) -> &Arc<SessionProbe> {
        &self.probe
    }

    /// Options of every launch attempt, in order
    pub fn launches(&self) -> Vec<SessionOptions> {
        self.launches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self, options: &SessionOptions) -> DriverResult<Arc<dyn BrowserDriver>> {
        let account = options.account.as_str();
        self.launches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(options.clone());

        let panics = self
            .panicking
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(account);
        assert!(!panics, "scripted launcher panicked for {account}");

        let fails = self
            .failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(account);
        if fails {
            return Err(DriverError::Transport("connection refused".into()));
        }

        let site = self
            .sites
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(account)
            .cloned()
            .unwrap_or_else(|| self.default_site.clone());
        self.probe.opened();
        Ok(Arc::new(ScriptedBrowser::for_site_with_probe(site, Arc::clone(&self.probe))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::RecordRepository;

    #[tokio::test]
    async fn test_database_creation() -> Result<()> {
        let db = TestDatabase::new().await?;
        assert!(!db.pool().is_closed());
        assert_eq!(db.records.count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_multiple_databases_are_isolated() -> Result<()> {
        let db1 = TestDatabase::new().await?;
        let db2 = TestDatabase::new().await?;
        db1.add_account("KR666", "secret").await?;
        assert_eq!(db1.accounts.count().await?, 1);
        assert_eq!(db2.accounts.count().await?, 0);
        Ok(())
    }

    #[test]
    fn dashboard_rows_have_every_column() {
        let html = dashboard_html(2);
        assert_eq!(html.matches("<tr>").count(), 3);
        assert_eq!(html.matches("<td>").count(), 22);
    }

    #[tokio::test]
    async fn scripted_site_redirects_after_submit() -> Result<()> {
        let browser = ScriptedBrowser::for_site(LoginSite::standard(dashboard_html(1)));
        browser.navigate(TARGET_URL).await?;
        let submit = browser.find_elements(&selectors::submit_by_type()).await?;
        assert_eq!(submit.len(), 1);
        browser.click(&submit[0]).await?;
        assert_eq!(browser.current_url().await?, DASHBOARD_URL);
        assert!(browser.element_index(&submit[0]).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn launcher_tracks_open_sessions() -> Result<()> {
        let launcher = ScriptedLauncher::new(LoginSite::standard(dashboard_html(1)));
        let options = SessionOptions {
            account: "KR666".into(),
            headless: true,
            page_load_timeout: Duration::from_secs(30),
            window_size: (1920, 1080),
            user_agent: "ua".into(),
        };
        let first = launcher.launch(&options).await?;
        let second = launcher.launch(&options).await?;
        assert_eq!(launcher.probe().peak(), 2);
        first.quit().await?;
        first.quit().await?;
        second.quit().await?;
        assert_eq!((launcher.probe().open(), launcher.probe().closed()), (0, 2));
        Ok(())
    }
}
