//! Browser capability used by the login state machine
//!
//! The crawler never talks to a browser engine directly. Everything it needs
//! is expressed by [`BrowserDriver`]; the WebDriver client in the
//! infrastructure layer is one implementation and the scripted fake in
//! `test_utils` is another.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// W3C WebDriver element reference key
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("no such element: {0}")]
    NoSuchElement(String),

    #[error("stale element reference: {0}")]
    StaleElement(String),

    #[error("browser operation timed out: {0}")]
    Timeout(String),

    #[error("browser command failed: {0}")]
    Command(String),

    #[error("browser transport failed: {0}")]
    Transport(String),

    #[error("browser session already closed")]
    SessionClosed,
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Element lookup mechanism
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum By {
    Name(String),
    TagName(String),
    Css(String),
    XPath(String),
}

impl By {
    pub fn name(value: impl Into<String>) -> Self {
        Self::Name(value.into())
    }

    pub fn tag(value: impl Into<String>) -> Self {
        Self::TagName(value.into())
    }

    pub fn css(value: impl Into<String>) -> Self {
        Self::Css(value.into())
    }

    pub fn xpath(value: impl Into<String>) -> Self {
        Self::XPath(value.into())
    }
}

impl std::fmt::Display for By {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(v) => write!(f, "name={v}"),
            Self::TagName(v) => write!(f, "tag={v}"),
            Self::Css(v) => write!(f, "css={v}"),
            Self::XPath(v) => write!(f, "xpath={v}"),
        }
    }
}

/// Opaque handle to an element inside one session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    pub id: String,
}

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// JSON form accepted as a script argument
    pub fn reference(&self) -> Value {
        serde_json::json!({ ELEMENT_KEY: self.id })
    }

    pub fn from_reference(value: &Value) -> Option<Self> {
        value.get(ELEMENT_KEY).and_then(Value::as_str).map(Self::new)
    }
}

/// Per-session launch parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub account: String,
    pub headless: bool,
    pub page_load_timeout: Duration,
    pub window_size: (u32, u32),
    pub user_agent: String,
}

/// One live browser session.
///
/// All methods take `&self` so a session can be shared with a watchdog that
/// force-quits it after a deadline.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> DriverResult<()>;
    async fn current_url(&self) -> DriverResult<String>;
    /// `document.readyState`
    async fn ready_state(&self) -> DriverResult<String>;
    async fn find_elements(&self, by: &By) -> DriverResult<Vec<ElementHandle>>;
    /// Run a script that returns an array of elements
    async fn find_elements_by_script(&self, script: &str, args: Vec<Value>) -> DriverResult<Vec<ElementHandle>>;
    async fn element_text(&self, element: &ElementHandle) -> DriverResult<String>;
    async fn element_attribute(&self, element: &ElementHandle, name: &str) -> DriverResult<Option<String>>;
    async fn element_tag(&self, element: &ElementHandle) -> DriverResult<String>;
    /// Displayed and enabled
    async fn is_clickable(&self, element: &ElementHandle) -> DriverResult<bool>;
    async fn click(&self, element: &ElementHandle) -> DriverResult<()>;
    async fn clear(&self, element: &ElementHandle) -> DriverResult<()>;
    async fn send_keys(&self, element: &ElementHandle, text: &str) -> DriverResult<()>;
    async fn execute_script(&self, script: &str, args: Vec<Value>) -> DriverResult<Value>;
    async fn page_source(&self) -> DriverResult<String>;
    /// PNG bytes of the current viewport
    async fn screenshot(&self) -> DriverResult<Vec<u8>>;
    /// Close the session; closing twice is not an error
    async fn quit(&self) -> DriverResult<()>;
}

/// Creates one isolated session per account task
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &SessionOptions) -> DriverResult<Arc<dyn BrowserDriver>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_reference_round_trips() {
        let handle = ElementHandle::new("abc-123");
        let reference = handle.reference();
        assert_eq!(reference[ELEMENT_KEY], "abc-123");
        assert_eq!(ElementHandle::from_reference(&reference), Some(handle));
        assert_eq!(ElementHandle::from_reference(&serde_json::json!({ "id": "x" })), None);
    }

    #[test]
    fn locator_display_names_mechanism() {
        assert_eq!(By::name("username").to_string(), "name=username");
        assert_eq!(By::xpath("//button").to_string(), "xpath=//button");
    }
}
