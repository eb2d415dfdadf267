//! Failure taxonomy of one account task
//!
//! Every variant is recovered at the task boundary: the orchestrator logs it,
//! marks the account `error` and keeps the rest of the cycle going.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::crawling::browser::DriverError;

#[derive(Error, Debug, Clone)]
pub enum CrawlError {
    #[error("Page {url} was not ready after {waited:?}")]
    NavigationTimeout { url: String, waited: Duration },

    #[error("Login form field '{field}' not found")]
    FormNotFound { field: String },

    #[error("Element '{target}' not found after strategies: {}", attempted.join(", "))]
    ElementNotFound { target: String, attempted: Vec<String> },

    #[error("No submit control matched any strategy")]
    SubmitControlNotFound,

    #[error("Login did not complete within {0:?}")]
    LoginTimeout(Duration),

    #[error("Report table did not appear within {0:?}")]
    ExtractionTimeout(Duration),

    #[error("Persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("Browser session could not be started: {0}")]
    SessionLaunch(DriverError),

    #[error("Browser driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Task exceeded its deadline of {0:?}")]
    Deadline(Duration),

    #[error("Task cancelled")]
    Cancelled,
}

/// Stable, serializable tag for each [`CrawlError`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlErrorKind {
    NavigationTimeout,
    FormNotFound,
    ElementNotFound,
    SubmitControlNotFound,
    LoginTimeout,
    ExtractionTimeout,
    PersistenceFailure,
    SessionLaunch,
    Driver,
    Deadline,
    Cancelled,
    Panicked,
}

impl CrawlError {
    pub const fn kind(&self) -> CrawlErrorKind {
        match self {
            Self::NavigationTimeout { .. } => CrawlErrorKind::NavigationTimeout,
            Self::FormNotFound { .. } => CrawlErrorKind::FormNotFound,
            Self::ElementNotFound { .. } => CrawlErrorKind::ElementNotFound,
            Self::SubmitControlNotFound => CrawlErrorKind::SubmitControlNotFound,
            Self::LoginTimeout(_) => CrawlErrorKind::LoginTimeout,
            Self::ExtractionTimeout(_) => CrawlErrorKind::ExtractionTimeout,
            Self::PersistenceFailure(_) => CrawlErrorKind::PersistenceFailure,
            Self::SessionLaunch(_) => CrawlErrorKind::SessionLaunch,
            Self::Driver(_) => CrawlErrorKind::Driver,
            Self::Deadline(_) => CrawlErrorKind::Deadline,
            Self::Cancelled => CrawlErrorKind::Cancelled,
        }
    }

    /// Failures that happened before the account ever signed in
    pub const fn is_login_failure(&self) -> bool {
        matches!(
            self,
            Self::NavigationTimeout { .. }
                | Self::FormNotFound { .. }
                | Self::ElementNotFound { .. }
                | Self::SubmitControlNotFound
                | Self::LoginTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_not_found_lists_strategies() {
        let err = CrawlError::ElementNotFound {
            target: "师门".into(),
            attempted: vec!["exact-text".into(), "script-scan".into()],
        };
        assert_eq!(err.to_string(), "Element '师门' not found after strategies: exact-text, script-scan");
        assert_eq!(err.kind(), CrawlErrorKind::ElementNotFound);
    }

    #[test]
    fn driver_errors_convert() {
        let err: CrawlError = DriverError::Transport("connection refused".into()).into();
        assert_eq!(err.kind(), CrawlErrorKind::Driver);
        assert!(!err.is_login_failure());
        assert!(CrawlError::LoginTimeout(Duration::from_secs(10)).is_login_failure());
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&CrawlErrorKind::SubmitControlNotFound).unwrap_or_default();
        assert_eq!(json, "\"submit_control_not_found\"");
    }
}
