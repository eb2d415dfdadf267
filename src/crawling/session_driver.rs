//! Per-account login state machine
//!
//! ```text
//! Start -> PageLoaded -> (CategorySelected) -> CredentialsEntered -> Submitted -> Authenticated
//!                                                                           \-> Failed
//! ```
//!
//! Each call to [`SessionDriver::advance`] performs one transition. The
//! category step is optional: when the control cannot be found the driver
//! logs it and goes straight on to the credentials. Any error moves the
//! machine to `Failed` and is returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::crawling::browser::{BrowserDriver, By, ElementHandle};
use crate::crawling::error::CrawlError;
use crate::crawling::locator::{CATEGORY_WAITS, ElementLocator};
use crate::crawling::snapshots::SnapshotRecorder;

const CLICK_SCRIPT: &str = "arguments[0].click();";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoginState {
    Start,
    PageLoaded,
    CategorySelected,
    CredentialsEntered,
    Submitted,
    Authenticated,
    Failed,
}

impl LoginState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::PageLoaded => "page_loaded",
            Self::CategorySelected => "category_selected",
            Self::CredentialsEntered => "credentials_entered",
            Self::Submitted => "submitted",
            Self::Authenticated => "authenticated",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Authenticated | Self::Failed)
    }
}

/// Bounded waits used during login and extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTimings {
    /// Document-ready wait after navigation
    pub page_load: Duration,
    pub category_waits: [Duration; 3],
    /// Wait for the username/password inputs
    pub form_wait: Duration,
    /// Wait for the post-submit redirect
    pub login_wait: Duration,
    /// Wait for the report table after login
    pub table_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for DriverTimings {
    fn default() -> Self {
        Self {
            page_load: Duration::from_secs(30),
            category_waits: CATEGORY_WAITS,
            form_wait: Duration::from_secs(10),
            login_wait: Duration::from_secs(10),
            table_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub target_url: String,
    pub category_label: Option<String>,
    pub timings: DriverTimings,
    pub snapshots: SnapshotRecorder,
}

pub struct SessionDriver {
    driver: Arc<dyn BrowserDriver>,
    username: String,
    secret: String,
    target_url: String,
    category: Option<ElementLocator>,
    submit: ElementLocator,
    timings: DriverTimings,
    snapshots: SnapshotRecorder,
    state: LoginState,
    history: Vec<LoginState>,
}

impl SessionDriver {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        username: impl Into<String>,
        secret: impl Into<String>,
        settings: LoginSettings,
    ) -> Self {
        let timings = settings.timings;
        let category = settings.category_label.as_deref().map(|label| {
            ElementLocator::category_selector_with_waits(label, timings.category_waits)
                .with_poll_interval(timings.poll_interval)
        });

        Self {
            driver,
            username: username.into(),
            secret: secret.into(),
            target_url: settings.target_url,
            category,
            submit: ElementLocator::submit_control().with_poll_interval(timings.poll_interval),
            timings,
            snapshots: settings.snapshots,
            state: LoginState::Start,
            history: vec![LoginState::Start],
        }
    }

    pub const fn state(&self) -> LoginState {
        self.state
    }

    /// Every state visited so far, starting with `Start`
    pub fn history(&self) -> &[LoginState] {
        &self.history
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Drive the machine until it is authenticated or fails
    pub async fn login(&mut self) -> Result<(), CrawlError> {
        while !self.state.is_terminal() {
            self.advance().await?;
        }
        Ok(())
    }

    /// Sign in, wait for the report table and return the page markup
    pub async fn fetch_report(&mut self) -> Result<String, CrawlError> {
        self.login().await?;
        self.authenticated_markup().await
    }

    /// Perform exactly one transition
    pub async fn advance(&mut self) -> Result<LoginState, CrawlError> {
        let result = match self.state {
            LoginState::Start => self.load_page().await.map(|()| LoginState::PageLoaded),
            LoginState::PageLoaded => {
                if self.select_category().await {
                    Ok(LoginState::CategorySelected)
                } else {
                    self.enter_credentials().await.map(|()| LoginState::CredentialsEntered)
                }
            }
            LoginState::CategorySelected => {
                self.enter_credentials().await.map(|()| LoginState::CredentialsEntered)
            }
            LoginState::CredentialsEntered => self.submit().await.map(|()| LoginState::Submitted),
            LoginState::Submitted => self.await_authentication().await.map(|()| LoginState::Authenticated),
            terminal @ (LoginState::Authenticated | LoginState::Failed) => return Ok(terminal),
        };

        match result {
            Ok(next) => {
                self.transition(next).await;
                Ok(next)
            }
            Err(e) => {
                warn!(account = %self.username, from = self.state.as_str(), error = %e, "login failed");
                self.transition(LoginState::Failed).await;
                Err(e)
            }
        }
    }

    /// Markup of the post-login page once a table is present
    pub async fn authenticated_markup(&self) -> Result<String, CrawlError> {
        if self.state != LoginState::Authenticated {
            return Err(CrawlError::LoginTimeout(self.timings.login_wait));
        }

        let table = &By::tag("table");
        let found = self
            .poll_until(self.timings.table_wait, || async move {
                Ok(!self.driver.find_elements(table).await?.is_empty())
            })
            .await?;
        if !found {
            self.snapshots
                .capture(self.driver.as_ref(), &self.username, "table_missing")
                .await;
            return Err(CrawlError::ExtractionTimeout(self.timings.table_wait));
        }

        Ok(self.driver.page_source().await?)
    }

    async fn transition(&mut self, next: LoginState) {
        debug!(account = %self.username, from = self.state.as_str(), to = next.as_str(), "login transition");
        self.state = next;
        self.history.push(next);
        self.snapshots
            .capture(self.driver.as_ref(), &self.username, next.as_str())
            .await;
    }

    async fn load_page(&self) -> Result<(), CrawlError> {
        self.driver.navigate(&self.target_url).await?;

        let ready = self
            .poll_until(self.timings.page_load, || async move {
                Ok(self.driver.ready_state().await? == "complete")
            })
            .await?;
        if ready {
            Ok(())
        } else {
            Err(CrawlError::NavigationTimeout {
                url: self.target_url.clone(),
                waited: self.timings.page_load,
            })
        }
    }

    /// True when the category control was found and clicked
    async fn select_category(&self) -> bool {
        let Some(locator) = &self.category else {
            return false;
        };

        match locator.locate(self.driver.as_ref()).await {
            Ok(element) => match self.click(&element).await {
                Ok(()) => {
                    info!(account = %self.username, label = locator.target(), "category selected");
                    true
                }
                Err(e) => {
                    warn!(account = %self.username, error = %e, "category control could not be clicked, continuing");
                    false
                }
            },
            Err(e) => {
                info!(account = %self.username, error = %e, "category control not found, continuing");
                false
            }
        }
    }

    async fn enter_credentials(&self) -> Result<(), CrawlError> {
        let username = self.wait_for_field("username").await?;
        let password = self.wait_for_field("password").await?;

        self.driver.clear(&username).await?;
        self.driver.send_keys(&username, &self.username).await?;
        self.driver.clear(&password).await?;
        self.driver.send_keys(&password, &self.secret).await?;
        Ok(())
    }

    async fn wait_for_field(&self, field: &str) -> Result<ElementHandle, CrawlError> {
        let by = By::name(field);
        let deadline = Instant::now() + self.timings.form_wait;
        loop {
            if let Some(element) = self.driver.find_elements(&by).await?.into_iter().next() {
                return Ok(element);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CrawlError::FormNotFound { field: field.to_string() });
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn submit(&self) -> Result<(), CrawlError> {
        let control = self
            .submit
            .locate(self.driver.as_ref())
            .await
            .map_err(|_| CrawlError::SubmitControlNotFound)?;
        self.click(&control).await
    }

    async fn await_authentication(&self) -> Result<(), CrawlError> {
        let login_url = normalize_url(&self.target_url);
        let username_field = &By::name("username");

        let authenticated = self
            .poll_until(self.timings.login_wait, || async move {
                let current = self.driver.current_url().await?;
                if normalize_url(&current) != login_url {
                    return Ok(true);
                }
                Ok(self.driver.find_elements(username_field).await?.is_empty())
            })
            .await?;

        if authenticated {
            info!(account = %self.username, "login succeeded");
            Ok(())
        } else {
            Err(CrawlError::LoginTimeout(self.timings.login_wait))
        }
    }

    /// Native click, falling back to a script click for covered or odd controls
    async fn click(&self, element: &ElementHandle) -> Result<(), CrawlError> {
        if let Err(e) = self.driver.click(element).await {
            debug!(account = %self.username, error = %e, "native click failed, trying script click");
            self.driver
                .execute_script(CLICK_SCRIPT, vec![element.reference()])
                .await?;
        }
        Ok(())
    }

    /// Poll `check` until it returns true or `wait` elapses; checked at least once
    async fn poll_until<F, Fut>(&self, wait: Duration, mut check: F) -> Result<bool, CrawlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, CrawlError>>,
    {
        let deadline = Instant::now() + wait;
        loop {
            if check().await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }
}

fn normalize_url(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{LoginSite, ScriptedBrowser, TARGET_URL, dashboard_html};

    fn settings(category: Option<&str>) -> LoginSettings {
        LoginSettings {
            target_url: TARGET_URL.to_string(),
            category_label: category.map(ToString::to_string),
            timings: DriverTimings::default(),
            snapshots: SnapshotRecorder::disabled(),
        }
    }

    fn driver_for(site: LoginSite, category: Option<&str>) -> (Arc<ScriptedBrowser>, SessionDriver) {
        let browser = Arc::new(ScriptedBrowser::for_site(site));
        let driver = SessionDriver::new(browser.clone(), "KR666", "secret", settings(category));
        (browser, driver)
    }

    #[test]
    fn trailing_slash_is_ignored_in_url_comparison() {
        assert_eq!(normalize_url("http://a/x8login/"), normalize_url("http://a/x8login"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_login_visits_every_state() -> anyhow::Result<()> {
        let (browser, mut driver) = driver_for(LoginSite::standard(dashboard_html(2)), Some("师门"));

        let markup = driver.fetch_report().await?;
        assert!(markup.contains("<table"));
        assert_eq!(
            driver.history(),
            [
                LoginState::Start,
                LoginState::PageLoaded,
                LoginState::CategorySelected,
                LoginState::CredentialsEntered,
                LoginState::Submitted,
                LoginState::Authenticated,
            ]
        );
        assert_eq!(browser.typed_value("username").as_deref(), Some("KR666"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn missing_category_control_is_skipped() -> anyhow::Result<()> {
        let (_browser, mut driver) =
            driver_for(LoginSite::standard(dashboard_html(1)).without_category(), Some("师门"));

        driver.login().await?;
        assert!(!driver.history().contains(&LoginState::CategorySelected));
        assert_eq!(driver.state(), LoginState::Authenticated);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn category_click_falls_back_to_script() -> anyhow::Result<()> {
        let (browser, mut driver) = driver_for(LoginSite::standard(dashboard_html(1)), Some("师门"));
        browser.fail_native_clicks(true);

        driver.login().await?;
        assert!(driver.history().contains(&LoginState::CategorySelected));
        assert!(browser.script_clicks() >= 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_password_times_out() {
        let (_browser, mut driver) =
            driver_for(LoginSite::standard(dashboard_html(1)).rejecting_password(), None);

        let result = driver.login().await;
        assert!(matches!(result, Err(CrawlError::LoginTimeout(_))));
        assert_eq!(driver.state(), LoginState::Failed);
        assert_eq!(driver.history().last(), Some(&LoginState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn page_never_ready_is_navigation_timeout() {
        let (_browser, mut driver) = driver_for(LoginSite::standard(dashboard_html(1)).never_ready(), None);
        let result = driver.login().await;
        assert!(matches!(result, Err(CrawlError::NavigationTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_form_is_reported_by_field() {
        let (_browser, mut driver) = driver_for(LoginSite::standard(dashboard_html(1)).without_form(), None);
        let result = driver.login().await;
        assert!(matches!(result, Err(CrawlError::FormNotFound { ref field }) if field == "username"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_submit_control_is_reported() {
        let (_browser, mut driver) =
            driver_for(LoginSite::standard(dashboard_html(1)).without_submit(), None);
        let result = driver.login().await;
        assert!(matches!(result, Err(CrawlError::SubmitControlNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn dashboard_without_table_is_extraction_timeout() {
        let (_browser, mut driver) = driver_for(LoginSite::standard("<html><body>empty</body></html>".into()), None);
        let result = driver.fetch_report().await;
        assert!(matches!(result, Err(CrawlError::ExtractionTimeout(_))));
        assert_eq!(driver.state(), LoginState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_state_does_not_advance() -> anyhow::Result<()> {
        let (_browser, mut driver) = driver_for(LoginSite::standard(dashboard_html(1)), None);
        driver.login().await?;
        let visited = driver.history().len();
        assert_eq!(driver.advance().await?, LoginState::Authenticated);
        assert_eq!(driver.history().len(), visited);
        Ok(())
    }
}
