//! Client configuration
//!
//! Both configs are plain values the host application builds once at startup.
//! They deserialize with serde (durations are expressed in milliseconds) and
//! can be read from the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::auth::AuthMethod;
use crate::error::{RestClientError, RestClientResult};
use crate::retry::RetryPolicy;

/// Environment variable holding the server base URL
pub const SERVER_URL_ENV: &str = "OPENCODE_SERVER";
/// Environment variable holding the bearer token
pub const AUTH_TOKEN_ENV: &str = "OPENCODE_AUTH_TOKEN";

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4096";
pub const DEFAULT_EVENT_PATH: &str = "/api/v1/event/subscribe";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EVENT_CAPACITY: usize = 100;
const DEFAULT_ERROR_CAPACITY: usize = 10;

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Append `path` (and its query, if any) to the path of `base`.
///
/// Unlike `Url::join`, a leading `/` does not replace the base path, so a
/// server mounted under a prefix keeps it.
pub(crate) fn append_path(base: &Url, path: &str) -> Url {
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{}/{}", prefix, path.trim_start_matches('/')));
    url.set_query(query);
    url
}

fn parse_base_url(base_url: &str) -> RestClientResult<Url> {
    let url = Url::parse(base_url)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RestClientError::InvalidConfig(format!(
            "unsupported URL scheme '{}' in {}",
            other, base_url
        ))),
    }
}

/// Configuration of the request/response client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    #[serde(with = "millis", rename = "timeoutMs")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "millis", rename = "retryBaseDelayMs")]
    pub retry_base_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `OPENCODE_SERVER` and `OPENCODE_AUTH_TOKEN`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = read_env(SERVER_URL_ENV) {
            config.base_url = url;
        }
        config.auth_token = read_env(AUTH_TOKEN_ENV);
        config
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Semantic checks serde cannot express
    pub fn validate(&self) -> RestClientResult<()> {
        parse_base_url(&self.base_url)?;
        if self.timeout.is_zero() {
            return Err(RestClientError::InvalidConfig(
                "request timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn base_url(&self) -> RestClientResult<Url> {
        parse_base_url(&self.base_url)
    }

    pub fn auth(&self) -> AuthMethod {
        AuthMethod::from_token(self.auth_token.as_deref())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay)
    }

    /// Event stream settings sharing this config's server and credential
    pub fn sse_config(&self) -> SseConfig {
        SseConfig {
            base_url: self.base_url.clone(),
            auth_token: self.auth_token.clone(),
            ..SseConfig::default()
        }
    }
}

/// Configuration of the event stream client.
///
/// Zero-valued delays, attempt counts, timeouts and capacities fall back to
/// their defaults when the client is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SseConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub event_path: String,
    #[serde(with = "millis", rename = "reconnectDelayMs")]
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(with = "millis", rename = "timeoutMs")]
    pub timeout: Duration,
    pub event_capacity: usize,
    pub error_capacity: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: None,
            event_path: DEFAULT_EVENT_PATH.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            timeout: DEFAULT_STREAM_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

impl SseConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_event_path(mut self, path: impl Into<String>) -> Self {
        self.event_path = path.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    /// Replace zero values with defaults
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.reconnect_delay.is_zero() {
            self.reconnect_delay = defaults.reconnect_delay;
        }
        if self.max_reconnect_attempts == 0 {
            self.max_reconnect_attempts = defaults.max_reconnect_attempts;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.event_capacity == 0 {
            self.event_capacity = defaults.event_capacity;
        }
        if self.error_capacity == 0 {
            self.error_capacity = defaults.error_capacity;
        }
        if self.event_path.is_empty() {
            self.event_path = defaults.event_path;
        }
        self
    }

    pub fn auth(&self) -> AuthMethod {
        AuthMethod::from_token(self.auth_token.as_deref())
    }

    /// Full URL of the event feed
    pub fn event_url(&self) -> RestClientResult<Url> {
        let base = parse_base_url(&self.base_url)?;
        Ok(append_path(&base, &self.event_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());

        let sse = SseConfig::default();
        assert_eq!(sse.reconnect_delay, Duration::from_secs(5));
        assert_eq!(sse.max_reconnect_attempts, 10);
        assert_eq!(sse.event_capacity, 100);
        assert_eq!(sse.error_capacity, 10);
    }

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let sse = SseConfig::new("http://localhost:4096")
            .with_reconnect_delay(Duration::ZERO)
            .with_max_reconnect_attempts(0)
            .with_timeout(Duration::ZERO)
            .with_event_capacity(0)
            .normalized();

        assert_eq!(sse.reconnect_delay, Duration::from_secs(5));
        assert_eq!(sse.max_reconnect_attempts, 10);
        assert_eq!(sse.timeout, Duration::from_secs(30));
        assert_eq!(sse.event_capacity, 100);
    }

    #[test]
    fn test_deserialize_from_json_with_millis() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "baseUrl": "https://example.com",
                "authToken": "abc",
                "timeoutMs": 1500,
                "maxRetries": 5
            }"#,
        )
        .unwrap();

        assert_eq!(config.base_url, "https://example.com");
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.auth(), AuthMethod::bearer("abc"));
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        assert!(matches!(
            ClientConfig::new("not a url").validate(),
            Err(RestClientError::Url(_))
        ));
        assert!(matches!(
            ClientConfig::new("ftp://example.com").validate(),
            Err(RestClientError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_event_url_joins_path() {
        let sse = SseConfig::new("http://localhost:4096");
        assert_eq!(
            sse.event_url().unwrap().as_str(),
            "http://localhost:4096/api/v1/event/subscribe"
        );
    }

    #[test]
    fn test_event_url_keeps_base_path_prefix() {
        for base in ["http://proxy:8080/opencode", "http://proxy:8080/opencode/"] {
            assert_eq!(
                SseConfig::new(base).event_url().unwrap().as_str(),
                "http://proxy:8080/opencode/api/v1/event/subscribe"
            );
        }
    }

    #[test]
    fn test_append_path_carries_query() {
        let base = Url::parse("http://srv:1/prefix").unwrap();
        assert_eq!(
            append_path(&base, "/session?directory=/tmp").as_str(),
            "http://srv:1/prefix/session?directory=/tmp"
        );
    }

    #[test]
    fn test_sse_config_inherits_server_and_token() {
        let sse = ClientConfig::new("http://srv:1").with_auth_token("t").sse_config();
        assert_eq!(sse.base_url, "http://srv:1");
        assert_eq!(sse.auth(), AuthMethod::bearer("t"));
    }
}
