//! Monitored account credentials and their crawl status

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of the most recent crawl for an account
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Never crawled yet
    #[default]
    Idle,
    /// Last crawl signed in and extracted the report
    Active,
    /// Last crawl failed somewhere between launch and extraction
    Error,
}

impl AccountStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" | "inactive" => Ok(Self::Idle),
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            other => Err(format!("Invalid AccountStatus: {other}")),
        }
    }
}

/// A credentialed account on the monitored site.
///
/// `enabled == false` takes the account out of every scheduled cycle; the
/// core never deletes accounts on its own.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountCredential {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub enabled: bool,
    pub last_status: AccountStatus,
    pub last_crawl_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AccountCredential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
            secret: secret.into(),
            enabled: true,
            last_status: AccountStatus::Idle,
            last_crawl_at: None,
            created_at: Utc::now(),
        }
    }
}

// Keeps the secret out of logs.
impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("secret", &"***")
            .field("enabled", &self.enabled)
            .field("last_status", &self.last_status)
            .field("last_crawl_at", &self.last_crawl_at)
            .finish_non_exhaustive()
    }
}
