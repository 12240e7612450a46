//! Configuration parsed from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::{DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX, RetryPolicy};

pub const DEFAULT_SESSION_INIT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_SESSION_SYNC_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_AUTH_ACTION_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_SITE_URL_PROD: &str = "https://www.curuminsleague.com";
pub const DEFAULT_SITE_URL_DEV: &str = "http://localhost:5173";
pub const AUTH_CALLBACK_PATH: &str = "/auth/callback?redirect_to=/dashboard";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Bound on the startup session check.
    pub init: Duration,
    /// Bound on handling one auth-change event.
    pub sync: Duration,
    /// Bound on a user-initiated provider call.
    pub action: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(DEFAULT_SESSION_INIT_TIMEOUT_SECS),
            sync: Duration::from_secs(DEFAULT_SESSION_SYNC_TIMEOUT_SECS),
            action: Duration::from_secs(DEFAULT_AUTH_ACTION_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub database_url: Option<String>,
    pub timeouts: SessionTimeouts,
    pub retry: RetryPolicy,
    pub auto_refresh: bool,
    pub session_storage_path: Option<PathBuf>,
    pub site_url: String,
}

impl Config {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `SUPABASE_URL`, `SUPABASE_ANON_KEY`
    ///
    /// Optional:
    /// - `DATABASE_URL`: only needed by commands that touch profiles
    /// - `SESSION_INIT_TIMEOUT_SECS`: default 5
    /// - `SESSION_SYNC_TIMEOUT_SECS`: default 10
    /// - `AUTH_ACTION_TIMEOUT_SECS`: default 15
    /// - `AUTH_RETRY_MAX`: default 3
    /// - `AUTH_RETRY_BASE_DELAY_MS`: default 1000
    /// - `AUTH_AUTO_REFRESH`: `true` (default) or `false`
    /// - `SESSION_STORAGE_PATH`: persist the session as a JSON file
    /// - `APP_ENV`: `production` selects `SITE_URL_PROD`, anything else `SITE_URL_DEV`
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a flag is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let supabase_url = required("SUPABASE_URL")?
            .trim_end_matches('/')
            .to_string();
        let supabase_anon_key = required("SUPABASE_ANON_KEY")?;
        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        let timeouts = SessionTimeouts {
            init: Duration::from_secs(env_parse("SESSION_INIT_TIMEOUT_SECS", DEFAULT_SESSION_INIT_TIMEOUT_SECS)),
            sync: Duration::from_secs(env_parse("SESSION_SYNC_TIMEOUT_SECS", DEFAULT_SESSION_SYNC_TIMEOUT_SECS)),
            action: Duration::from_secs(env_parse("AUTH_ACTION_TIMEOUT_SECS", DEFAULT_AUTH_ACTION_TIMEOUT_SECS)),
        };
        let retry = RetryPolicy::new(
            env_parse("AUTH_RETRY_MAX", DEFAULT_RETRY_MAX),
            Duration::from_millis(env_parse("AUTH_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)),
        );
        let auto_refresh = parse_bool("AUTH_AUTO_REFRESH", std::env::var("AUTH_AUTO_REFRESH").ok().as_deref())?;
        let session_storage_path = std::env::var("SESSION_STORAGE_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let site_url = site_url(std::env::var("APP_ENV").ok().as_deref());

        Ok(Self {
            supabase_url,
            supabase_anon_key,
            database_url,
            timeouts,
            retry,
            auto_refresh,
            session_storage_path,
            site_url,
        })
    }

    /// Where links in confirmation and magic-link emails should land.
    #[must_use]
    pub fn email_redirect_url(&self) -> String {
        format!("{}{AUTH_CALLBACK_PATH}", self.site_url.trim_end_matches('/'))
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &'static str, raw: Option<&str>) -> Result<bool, ConfigError> {
    match raw.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
        None | Some("" | "true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid { key, value: other.to_string() }),
    }
}

fn site_url(app_env: Option<&str>) -> String {
    if app_env == Some("production") {
        std::env::var("SITE_URL_PROD").unwrap_or_else(|_| DEFAULT_SITE_URL_PROD.to_string())
    } else {
        std::env::var("SITE_URL_DEV").unwrap_or_else(|_| DEFAULT_SITE_URL_DEV.to_string())
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
