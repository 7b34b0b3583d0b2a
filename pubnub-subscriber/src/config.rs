use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{ReceiveRecovery, RetryConfiguration};
use crate::types::{Error, Result};

pub(crate) const DEFAULT_ORIGIN: &str = "ps.pndsn.com";
pub(crate) const DEFAULT_PRESENCE_TIMEOUT: u64 = 300;
pub(crate) const MAXIMUM_PRESENCE_TIMEOUT: u64 = 320;
pub(crate) const MINIMUM_PRESENCE_TIMEOUT: u64 = 20;
pub(crate) const DEFAULT_SUBSCRIBE_REQUEST_TIMEOUT: u64 = 310;
pub(crate) const DEFAULT_TRANSACTIONAL_REQUEST_TIMEOUT: u64 = 15;
pub(crate) const DEFAULT_DEDUPE_CACHE_SIZE: usize = 100;
pub(crate) const DEFAULT_REQUEST_MESSAGE_COUNT_THRESHOLD: usize = 100;

/// User-facing client configuration.
///
/// Timeouts are in seconds. Every field has a default except `subscribe_key`
/// and `user_id`, which `resolve` requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub subscribe_key: String,
    pub user_id: Option<String>,
    pub origin: Option<String>,
    pub ssl: bool,
    /// Presence timeout; when set, the heartbeat interval is derived from it.
    pub presence_timeout: Option<u64>,
    /// Heartbeat interval; `0` disables heartbeats.
    pub heartbeat_interval: Option<u64>,
    pub subscribe_request_timeout: u64,
    pub transactional_request_timeout: u64,
    pub suppress_leave_events: bool,
    pub maintain_presence_state: bool,
    pub enable_dedupe: bool,
    pub dedupe_cache_size: usize,
    pub request_message_count_threshold: usize,
    pub filter_expression: Option<String>,
    pub use_request_id: bool,
    pub retry: RetryConfiguration,
    pub receive_recovery: ReceiveRecovery,
    pub announce_successful_heartbeats: bool,
    pub announce_failed_heartbeats: bool,

    // Legacy aliases; take precedence over the fields above when set.
    pub dedupe_on_subscribe: Option<bool>,
    pub maximum_cache_size: Option<usize>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            subscribe_key: String::new(),
            user_id: None,
            origin: None,
            ssl: true,
            presence_timeout: None,
            heartbeat_interval: None,
            subscribe_request_timeout: DEFAULT_SUBSCRIBE_REQUEST_TIMEOUT,
            transactional_request_timeout: DEFAULT_TRANSACTIONAL_REQUEST_TIMEOUT,
            suppress_leave_events: false,
            maintain_presence_state: true,
            enable_dedupe: false,
            dedupe_cache_size: DEFAULT_DEDUPE_CACHE_SIZE,
            request_message_count_threshold: DEFAULT_REQUEST_MESSAGE_COUNT_THRESHOLD,
            filter_expression: None,
            use_request_id: true,
            retry: RetryConfiguration::default(),
            receive_recovery: ReceiveRecovery::default(),
            announce_successful_heartbeats: false,
            announce_failed_heartbeats: true,
            dedupe_on_subscribe: None,
            maximum_cache_size: None,
        }
    }
}

impl Configuration {
    pub fn new(subscribe_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            subscribe_key: subscribe_key.into(),
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Validate and normalize into the form the client runs with.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let user_id = match self.user_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            Some(_) => return Err(Error::Validation("user_id must not be blank".into())),
            None => return Err(Error::Validation("user_id is required".into())),
        };
        if self.subscribe_key.trim().is_empty() {
            return Err(Error::Validation("subscribe_key is required".into()));
        }
        self.retry.validate()?;

        let presence_timeout = self
            .presence_timeout
            .unwrap_or(DEFAULT_PRESENCE_TIMEOUT)
            .clamp(MINIMUM_PRESENCE_TIMEOUT, MAXIMUM_PRESENCE_TIMEOUT);

        let heartbeat_interval = match (self.presence_timeout, self.heartbeat_interval) {
            (Some(_), _) => Some(presence_timeout / 2 - 1),
            (None, Some(0)) | (None, None) => None,
            (None, Some(interval)) => Some(interval),
        }
        .map(Duration::from_secs);

        let origin = self
            .origin
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or(DEFAULT_ORIGIN)
            .to_string();

        Ok(ResolvedConfig {
            subscribe_key: self.subscribe_key.trim().to_string(),
            user_id,
            origin,
            ssl: self.ssl,
            presence_timeout: Duration::from_secs(presence_timeout),
            heartbeat_interval,
            subscribe_request_timeout: Duration::from_secs(self.subscribe_request_timeout),
            transactional_request_timeout: Duration::from_secs(self.transactional_request_timeout),
            suppress_leave_events: self.suppress_leave_events,
            maintain_presence_state: self.maintain_presence_state,
            enable_dedupe: self.dedupe_on_subscribe.unwrap_or(self.enable_dedupe),
            dedupe_cache_size: self.maximum_cache_size.unwrap_or(self.dedupe_cache_size),
            request_message_count_threshold: self.request_message_count_threshold,
            filter_expression: self
                .filter_expression
                .clone()
                .filter(|f| !f.trim().is_empty()),
            use_request_id: self.use_request_id,
            retry: self.retry.clone(),
            receive_recovery: self.receive_recovery.clone(),
            announce_successful_heartbeats: self.announce_successful_heartbeats,
            announce_failed_heartbeats: self.announce_failed_heartbeats,
        })
    }
}

/// Validated configuration shared by the event loop and transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub subscribe_key: String,
    pub user_id: String,
    pub origin: String,
    pub ssl: bool,
    pub presence_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub subscribe_request_timeout: Duration,
    pub transactional_request_timeout: Duration,
    pub suppress_leave_events: bool,
    pub maintain_presence_state: bool,
    pub enable_dedupe: bool,
    pub dedupe_cache_size: usize,
    pub request_message_count_threshold: usize,
    pub filter_expression: Option<String>,
    pub use_request_id: bool,
    pub retry: RetryConfiguration,
    pub receive_recovery: ReceiveRecovery,
    pub announce_successful_heartbeats: bool,
    pub announce_failed_heartbeats: bool,
}

impl ResolvedConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        if self.origin.contains("://") {
            self.origin.clone()
        } else {
            format!("{scheme}://{}", self.origin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let resolved = Configuration::new("demo", "user-1").resolve().unwrap();
        assert_eq!(resolved.origin, DEFAULT_ORIGIN);
        assert_eq!(resolved.presence_timeout, Duration::from_secs(300));
        assert_eq!(resolved.heartbeat_interval, None);
        assert_eq!(resolved.subscribe_request_timeout, Duration::from_secs(310));
        assert!(!resolved.enable_dedupe);
        assert_eq!(resolved.dedupe_cache_size, 100);
        assert!(resolved.announce_failed_heartbeats);
        assert!(!resolved.announce_successful_heartbeats);
        assert_eq!(resolved.base_url(), "https://ps.pndsn.com");
    }

    #[test]
    fn user_id_required_and_not_blank() {
        let mut config = Configuration::new("demo", "   ");
        assert!(matches!(config.resolve(), Err(Error::Validation(_))));
        config.user_id = None;
        assert!(matches!(config.resolve(), Err(Error::Validation(_))));
    }

    #[test]
    fn subscribe_key_required() {
        let config = Configuration::new("", "user-1");
        assert!(matches!(config.resolve(), Err(Error::Validation(_))));
    }

    #[test]
    fn presence_timeout_derives_heartbeat_interval() {
        let mut config = Configuration::new("demo", "user-1");
        config.presence_timeout = Some(300);
        config.heartbeat_interval = Some(10);
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.heartbeat_interval, Some(Duration::from_secs(149)));
    }

    #[test]
    fn presence_timeout_is_clamped() {
        let mut config = Configuration::new("demo", "user-1");
        config.presence_timeout = Some(1000);
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.presence_timeout, Duration::from_secs(320));
        assert_eq!(resolved.heartbeat_interval, Some(Duration::from_secs(159)));
    }

    #[test]
    fn explicit_interval_and_zero_disables() {
        let mut config = Configuration::new("demo", "user-1");
        config.heartbeat_interval = Some(60);
        assert_eq!(
            config.resolve().unwrap().heartbeat_interval,
            Some(Duration::from_secs(60))
        );
        config.heartbeat_interval = Some(0);
        assert_eq!(config.resolve().unwrap().heartbeat_interval, None);
    }

    #[test]
    fn legacy_overrides_win() {
        let mut config = Configuration::new("demo", "user-1");
        config.dedupe_on_subscribe = Some(true);
        config.maximum_cache_size = Some(5);
        let resolved = config.resolve().unwrap();
        assert!(resolved.enable_dedupe);
        assert_eq!(resolved.dedupe_cache_size, 5);
    }

    #[test]
    fn invalid_retry_rejected() {
        let mut config = Configuration::new("demo", "user-1");
        config.retry = RetryConfiguration::linear(Duration::from_secs(1), 2);
        assert!(matches!(config.resolve(), Err(Error::Validation(_))));
    }

    #[test]
    fn deserializes_partial_json() {
        let config: Configuration = serde_json::from_str(
            r#"{"subscribe_key":"demo","user_id":"u","origin":"localhost:8080","ssl":false}"#,
        )
        .unwrap();
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.base_url(), "http://localhost:8080");
        assert!(resolved.maintain_presence_state);
    }
}
