//! W3C WebDriver client
//!
//! Talks to a chromedriver-compatible endpoint over HTTP. One
//! [`WebDriverSession`] is one browser process; the launcher creates a fresh
//! session per account task so cookies and state never leak between accounts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::crawling::browser::{
    BrowserDriver, BrowserLauncher, By, DriverError, DriverResult, ElementHandle, SessionOptions,
};

/// Creates chrome sessions on a WebDriver endpoint
#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    client: Client,
    base_url: String,
}

impl WebDriverLauncher {
    pub fn new(webdriver_url: &str) -> Result<Self> {
        let parsed = url::Url::parse(webdriver_url).context("Invalid WebDriver url")?;
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .context("Failed to create WebDriver HTTP client")?;
        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn capabilities(options: &SessionOptions) -> Value {
        let (width, height) = options.window_size;
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
            format!("--window-size={width},{height}"),
            format!("--user-agent={}", options.user_agent),
        ];
        if options.headless {
            args.insert(0, "--headless=new".to_string());
        }

        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "normal",
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self, options: &SessionOptions) -> DriverResult<Arc<dyn BrowserDriver>> {
        let url = format!("{}/session", self.base_url);
        let value = send(&self.client, Method::POST, &url, Some(Self::capabilities(options))).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Command("new session response has no sessionId".into()))?;

        let session = WebDriverSession {
            client: self.client.clone(),
            session_url: format!("{}/session/{session_id}", self.base_url),
            closed: AtomicBool::new(false),
        };

        let page_load_ms = u64::try_from(options.page_load_timeout.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = session
            .command(Method::POST, "/timeouts", Some(json!({ "pageLoad": page_load_ms, "script": 30_000 })))
            .await
        {
            warn!(account = %options.account, error = %e, "could not set session timeouts");
        }

        info!(account = %options.account, session_id, headless = options.headless, "browser session started");
        Ok(Arc::new(session))
    }
}

/// One live WebDriver session
#[derive(Debug)]
pub struct WebDriverSession {
    client: Client,
    session_url: String,
    closed: AtomicBool,
}

impl WebDriverSession {
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> DriverResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::SessionClosed);
        }
        send(&self.client, method, &format!("{}{path}", self.session_url), body).await
    }

    async fn element_command(&self, method: Method, element: &ElementHandle, path: &str, body: Option<Value>) -> DriverResult<Value> {
        self.command(method, &format!("/element/{}{path}", element.id), body).await
    }
}

/// Send one command and unwrap the `value` envelope
async fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> DriverResult<Value> {
    let mut request = client.request(method.clone(), url);
    // W3C requires a JSON body on every POST, even an empty one
    if method == Method::POST {
        request = request.json(&body.unwrap_or_else(|| json!({})));
    }

    let response = request.send().await.map_err(map_transport_error)?;
    let status = response.status();
    let payload: Value = response.json().await.map_err(map_transport_error)?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        Ok(value)
    } else {
        let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(%status, error, "webdriver command failed");
        Err(map_error(error, message))
    }
}

fn map_transport_error(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::Timeout(e.to_string())
    } else {
        DriverError::Transport(e.to_string())
    }
}

/// Translate a W3C error code into the capability error
pub fn map_error(error: &str, message: String) -> DriverError {
    match error {
        "no such element" => DriverError::NoSuchElement(message),
        "stale element reference" => DriverError::StaleElement(message),
        "timeout" | "script timeout" => DriverError::Timeout(message),
        "invalid session id" => DriverError::SessionClosed,
        other => DriverError::Command(format!("{other}: {message}")),
    }
}

/// `(using, value)` pair for the find-elements endpoint
pub fn locator_strategy(by: &By) -> (&'static str, String) {
    match by {
        By::Name(name) => ("css selector", format!("[name=\"{}\"]", name.replace('"', "\\\""))),
        By::TagName(tag) => ("tag name", tag.clone()),
        By::Css(css) => ("css selector", css.clone()),
        By::XPath(xpath) => ("xpath", xpath.clone()),
    }
}

/// Element handles out of a JSON array of element references
pub fn parse_elements(value: &Value) -> Vec<ElementHandle> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(ElementHandle::from_reference).collect())
        .unwrap_or_default()
}

fn as_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl BrowserDriver for WebDriverSession {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        self.command(Method::POST, "/url", Some(json!({ "url": url }))).await?;
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        Ok(as_string(self.command(Method::GET, "/url", None).await?))
    }

    async fn ready_state(&self) -> DriverResult<String> {
        Ok(as_string(self.execute_script("return document.readyState;", Vec::new()).await?))
    }

    async fn find_elements(&self, by: &By) -> DriverResult<Vec<ElementHandle>> {
        let (using, value) = locator_strategy(by);
        let result = self
            .command(Method::POST, "/elements", Some(json!({ "using": using, "value": value })))
            .await?;
        Ok(parse_elements(&result))
    }

    async fn find_elements_by_script(&self, script: &str, args: Vec<Value>) -> DriverResult<Vec<ElementHandle>> {
        let result = self.execute_script(script, args).await?;
        Ok(parse_elements(&result))
    }

    async fn element_text(&self, element: &ElementHandle) -> DriverResult<String> {
        Ok(as_string(self.element_command(Method::GET, element, "/text", None).await?))
    }

    async fn element_attribute(&self, element: &ElementHandle, name: &str) -> DriverResult<Option<String>> {
        let value = self
            .element_command(Method::GET, element, &format!("/attribute/{name}"), None)
            .await?;
        Ok(match value {
            Value::Null => None,
            other => Some(as_string(other)),
        })
    }

    async fn element_tag(&self, element: &ElementHandle) -> DriverResult<String> {
        Ok(as_string(self.element_command(Method::GET, element, "/name", None).await?))
    }

    async fn is_clickable(&self, element: &ElementHandle) -> DriverResult<bool> {
        let displayed = self.element_command(Method::GET, element, "/displayed", None).await?;
        if !displayed.as_bool().unwrap_or(false) {
            return Ok(false);
        }
        let enabled = self.element_command(Method::GET, element, "/enabled", None).await?;
        Ok(enabled.as_bool().unwrap_or(false))
    }

    async fn click(&self, element: &ElementHandle) -> DriverResult<()> {
        self.element_command(Method::POST, element, "/click", None).await?;
        Ok(())
    }

    async fn clear(&self, element: &ElementHandle) -> DriverResult<()> {
        self.element_command(Method::POST, element, "/clear", None).await?;
        Ok(())
    }

    async fn send_keys(&self, element: &ElementHandle, text: &str) -> DriverResult<()> {
        self.element_command(Method::POST, element, "/value", Some(json!({ "text": text })))
            .await?;
        Ok(())
    }

    async fn execute_script(&self, script: &str, args: Vec<Value>) -> DriverResult<Value> {
        self.command(Method::POST, "/execute/sync", Some(json!({ "script": script, "args": args })))
            .await
    }

    async fn page_source(&self) -> DriverResult<String> {
        Ok(as_string(self.command(Method::GET, "/source", None).await?))
    }

    async fn screenshot(&self) -> DriverResult<Vec<u8>> {
        let encoded = as_string(self.command(Method::GET, "/screenshot", None).await?);
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| DriverError::Command(format!("screenshot is not valid base64: {e}")))
    }

    async fn quit(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match send(&self.client, Method::DELETE, &self.session_url, None).await {
            Ok(_) | Err(DriverError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
