//! Runtime configuration shared by the API server and the CLI.
//!
//! Values come from environment variables through a lookup function so the
//! parsing can be exercised without touching the process environment.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::kobo::KoboConfig;
use crate::util::is_http_url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where submissions are persisted
#[derive(Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    /// Local `SQLite` file
    Local { path: String },
    /// Remote libSQL server
    Remote { url: String, auth_token: String },
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => formatter.debug_struct("Local").field("path", path).finish(),
            Self::Remote { url, .. } => formatter
                .debug_struct("Remote")
                .field("url", url)
                .field("auth_token", &"[REDACTED]")
                .finish(),
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Read `DATABASE_URL`; remote URLs also need `DATABASE_AUTH_TOKEN`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = value_or_default(&lookup, "DATABASE_URL", "wildwatch.db");
        if database_url.starts_with("libsql://") || is_http_url(&database_url) {
            Ok(Self::Remote {
                url: database_url,
                auth_token: required_trimmed(&lookup, "DATABASE_AUTH_TOKEN")?,
            })
        } else {
            Ok(Self::Local {
                path: database_url
                    .strip_prefix("file:")
                    .unwrap_or(&database_url)
                    .to_string(),
            })
        }
    }
}

/// Reconciliation tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Scheduler period; `None` disables scheduled runs
    pub interval: Option<Duration>,
    pub page_size: u32,
    pub max_push_attempts: u32,
    /// Forms the scheduler reconciles; empty means every cached form
    pub forms: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(300)),
            page_size: 100,
            max_push_attempts: 3,
            forms: Vec::new(),
        }
    }
}

/// Settings every Wildwatch binary needs
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    pub kobo: KoboConfig,
    pub sync: SyncSettings,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database = DatabaseConfig::from_lookup(&lookup)?;

        let server_url =
            value_or_default(&lookup, "KOBO_SERVER_URL", "https://kf.kobotoolbox.org");
        if !is_http_url(&server_url) {
            return Err(ConfigError::Invalid(
                "KOBO_SERVER_URL must start with http:// or https://".to_string(),
            ));
        }
        let api_token = required_trimmed(&lookup, "KOBO_API_TOKEN")?;
        let timeout_secs: u64 = parse_bounded(&lookup, "KOBO_TIMEOUT_SECS", "30", 1..=300)?;
        let max_retries: u32 = parse_bounded(&lookup, "KOBO_MAX_RETRIES", "3", 0..=10)?;

        let interval_secs: u64 = parse_bounded(&lookup, "SYNC_INTERVAL_SECS", "300", 0..=86_400)?;
        let page_size: u32 = parse_bounded(&lookup, "SYNC_PAGE_SIZE", "100", 1..=1_000)?;
        let max_push_attempts: u32 =
            parse_bounded(&lookup, "SYNC_MAX_PUSH_ATTEMPTS", "3", 1..=20)?;
        let forms = optional_trimmed(&lookup, "SYNC_FORMS")
            .map(|value| split_list(&value))
            .unwrap_or_default();

        Ok(Self {
            database,
            kobo: KoboConfig {
                server_url: server_url.trim_end_matches('/').to_string(),
                api_token,
                timeout: Duration::from_secs(timeout_secs),
                max_retries,
            },
            sync: SyncSettings {
                interval: (interval_secs > 0).then(|| Duration::from_secs(interval_secs)),
                page_size,
                max_push_attempts,
                forms,
            },
        })
    }
}

/// Trimmed value or `default` when unset or blank.
pub fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

pub fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

pub fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Parse an integer variable and check it against an inclusive range.
pub fn parse_bounded<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + fmt::Display,
{
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = value_or_default(lookup, name, default)
        .parse::<T>()
        .map_err(|_| invalid())?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
