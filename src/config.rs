//! Portal client configuration.
//!
//! Every tunable used by the stream client, the notifications API client,
//! and the unread-count poller lives in [`PortalConfig`]. Values come from
//! [`PortalDefaults`] unless overridden through environment variables.

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

/// Environment variable holding the portal API base URL.
pub const ENV_API_BASE_URL: &str = "PORTAL_API_BASE_URL";
/// Environment variable holding the session cookie sent with every request.
pub const ENV_SESSION_COOKIE: &str = "PORTAL_SESSION_COOKIE";
/// Environment variable overriding the base reconnect interval.
pub const ENV_RECONNECT_INTERVAL_MS: &str = "PORTAL_STREAM_RECONNECT_INTERVAL_MS";
/// Environment variable overriding the reconnect attempt ceiling.
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "PORTAL_STREAM_MAX_RECONNECT_ATTEMPTS";
/// Environment variable overriding the stream idle timeout (`0` disables).
pub const ENV_IDLE_TIMEOUT_MS: &str = "PORTAL_STREAM_IDLE_TIMEOUT_MS";
/// Environment variable overriding the unread-count poll interval (`0` disables).
pub const ENV_UNREAD_POLL_INTERVAL_MS: &str = "PORTAL_UNREAD_POLL_INTERVAL_MS";
/// Environment variable overriding the per-request HTTP timeout.
pub const ENV_HTTP_TIMEOUT_MS: &str = "PORTAL_HTTP_TIMEOUT_MS";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortalDefaults;

impl PortalDefaults {
    pub const API_BASE_URL: &'static str = "http://localhost:3000/api";
    pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
    pub const UNREAD_POLL_INTERVAL: Duration = Duration::from_secs(60);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Resolved client configuration.
#[derive(Clone, Debug)]
pub struct PortalConfig {
    /// Base URL of the portal API, without a trailing slash.
    pub api_base_url: String,
    /// Session cookie forwarded as the `Cookie` header.
    pub session_cookie: Option<SecretString>,
    /// Base interval of the linear reconnect backoff.
    pub reconnect_interval: Duration,
    /// Number of reconnect attempts before the stream client gives up.
    pub max_reconnect_attempts: u32,
    /// Longest silence tolerated on an open stream before it is treated as
    /// failed. Heartbeats reset the timer.
    pub idle_timeout: Option<Duration>,
    /// Interval of the background unread-count refresh.
    pub unread_poll_interval: Option<Duration>,
    /// TCP/TLS connect timeout for HTTP requests.
    pub connect_timeout: Duration,
    /// Per-attempt timeout for REST requests.
    pub request_timeout: Duration,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            api_base_url: PortalDefaults::API_BASE_URL.to_string(),
            session_cookie: None,
            reconnect_interval: PortalDefaults::RECONNECT_INTERVAL,
            max_reconnect_attempts: PortalDefaults::MAX_RECONNECT_ATTEMPTS,
            idle_timeout: Some(PortalDefaults::IDLE_TIMEOUT),
            unread_poll_interval: Some(PortalDefaults::UNREAD_POLL_INTERVAL),
            connect_timeout: PortalDefaults::CONNECT_TIMEOUT,
            request_timeout: PortalDefaults::REQUEST_TIMEOUT,
        }
    }
}

impl PortalConfig {
    /// Creates a configuration for `api_base_url` with default tuning.
    pub fn new(api_base_url: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: normalize_base_url(&api_base_url.into())?,
            ..Self::default()
        })
    }

    /// Loads configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// Unset or blank keys keep their default value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();

        if let Some(base) = read(ENV_API_BASE_URL) {
            config.api_base_url = normalize_base_url(&base)?;
        }
        if let Some(cookie) = read(ENV_SESSION_COOKIE) {
            config.session_cookie = Some(SecretString::new(cookie));
        }
        if let Some(ms) = read_millis(&read, ENV_RECONNECT_INTERVAL_MS)? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: ENV_RECONNECT_INTERVAL_MS,
                    reason: "must be > 0".to_string(),
                });
            }
            config.reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(raw) = read(ENV_MAX_RECONNECT_ATTEMPTS) {
            config.max_reconnect_attempts =
                raw.parse().map_err(|_| ConfigError::Invalid {
                    key: ENV_MAX_RECONNECT_ATTEMPTS,
                    reason: format!("expected an unsigned integer, got {raw:?}"),
                })?;
        }
        if let Some(ms) = read_millis(&read, ENV_IDLE_TIMEOUT_MS)? {
            config.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = read_millis(&read, ENV_UNREAD_POLL_INTERVAL_MS)? {
            config.unread_poll_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = read_millis(&read, ENV_HTTP_TIMEOUT_MS)? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: ENV_HTTP_TIMEOUT_MS,
                    reason: "must be > 0".to_string(),
                });
            }
            config.request_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Sets the session cookie forwarded with stream and API requests.
    pub fn with_session_cookie(mut self, cookie: SecretString) -> Self {
        self.session_cookie = Some(cookie);
        self
    }

    /// Server-push endpoint: `<base>/stream`.
    pub fn stream_endpoint(&self) -> String {
        format!("{}/stream", self.api_base_url)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("invalid api base url {0:?}: expected an http:// or https:// url")]
    InvalidBaseUrl(String),
}

fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let has_scheme = trimmed.starts_with("http://") || trimmed.starts_with("https://");
    let has_host = trimmed
        .split_once("://")
        .is_some_and(|(_, rest)| !rest.is_empty());
    if !has_scheme || !has_host {
        return Err(ConfigError::InvalidBaseUrl(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

fn read_millis<R>(read: &R, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    R: Fn(&str) -> Option<String>,
{
    read(key)
        .map(|raw| {
            raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
                key,
                reason: format!("expected milliseconds, got {raw:?}"),
            })
        })
        .transpose()
}
