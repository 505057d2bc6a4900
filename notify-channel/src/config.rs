//! Configuration types for the notify-channel crate
//!
//! This module defines the settings that control how the notification
//! channel reaches the broker and how it paces retries, credential polling
//! and the visibility grace period.

use std::time::Duration;

use stomp_frame::HeartBeat;
use url::Url;

use crate::error::{ChannelError, Result};

/// How long to wait before the next connection attempt.
///
/// Whatever the policy, the supervisor keeps at most one retry timer pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay after every failure
    Fixed(Duration),
    /// Doubling delay starting at `initial`, capped at `max`. The attempt
    /// counter resets after every successful handshake.
    Exponential { initial: Duration, max: Duration },
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { initial, max } => 2u32
                .checked_pow(attempt)
                .and_then(|factor| initial.checked_mul(factor))
                .map_or(max, |delay| delay.min(max)),
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            RetryPolicy::Fixed(delay) if delay.is_zero() => Err(ChannelError::Configuration(
                "Retry interval must be greater than 0".to_string(),
            )),
            RetryPolicy::Exponential { initial, max } if initial.is_zero() || max < initial => {
                Err(ChannelError::Configuration(
                    "Exponential retry needs 0 < initial <= max".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(Duration::from_secs(10))
    }
}

/// Configuration for the notification channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// HTTP(S) base address of the backend, e.g. `https://api.example.com`
    pub base_url: String,

    /// Path of the WebSocket endpoint below the base address
    /// Default: "/ws"
    pub endpoint_path: String,

    /// Query parameter that carries the credential
    /// Default: "token"
    pub credential_param: String,

    /// User-scoped destination to subscribe to
    /// Default: "/user/queue/notifications"
    pub destination: String,

    /// Delay policy between connection attempts
    /// Default: fixed 10 seconds
    pub retry_policy: RetryPolicy,

    /// How often the credential source is polled for rotation
    /// Default: 5 seconds
    pub credential_poll_interval: Duration,

    /// How long the host may stay hidden before it is treated as terminating
    /// Default: 1 second
    pub hidden_grace_period: Duration,

    /// Upper bound for the whole connect + subscribe handshake
    /// Default: 15 seconds
    pub handshake_timeout: Duration,

    /// Heart-beat intervals offered to the broker
    /// Default: 10000,10000
    pub heart_beat: HeartBeat,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            endpoint_path: "/ws".to_string(),
            credential_param: "token".to_string(),
            destination: "/user/queue/notifications".to_string(),
            retry_policy: RetryPolicy::default(),
            credential_poll_interval: Duration::from_secs(5),
            hidden_grace_period: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(15),
            heart_beat: HeartBeat::new(10_000, 10_000),
        }
    }
}

impl ChannelConfig {
    /// Create a configuration for the given backend with default values
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Quick recovery for interactive sessions: 2s retries, 1s credential poll
    pub fn fast_recovery(base_url: impl Into<String>) -> Self {
        Self {
            retry_policy: RetryPolicy::Fixed(Duration::from_secs(2)),
            credential_poll_interval: Duration::from_secs(1),
            ..Self::new(base_url)
        }
    }

    /// Long-running headless services back off instead of retrying every 10s
    pub fn headless_service(base_url: impl Into<String>) -> Self {
        Self {
            retry_policy: RetryPolicy::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(300),
            },
            ..Self::new(base_url)
        }
    }

    /// Build a configuration from `NOTIFY_*` environment variables.
    ///
    /// - `NOTIFY_BROKER_URL` (required)
    /// - `NOTIFY_DESTINATION`
    /// - `NOTIFY_RETRY_SECS`
    /// - `NOTIFY_CREDENTIAL_POLL_SECS`
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("NOTIFY_BROKER_URL").map_err(|_| {
            ChannelError::Configuration("NOTIFY_BROKER_URL is not set".to_string())
        })?;
        let mut config = Self::new(base_url);

        if let Ok(destination) = std::env::var("NOTIFY_DESTINATION") {
            config.destination = destination;
        }
        if let Some(secs) = env_secs("NOTIFY_RETRY_SECS")? {
            config.retry_policy = RetryPolicy::Fixed(secs);
        }
        if let Some(secs) = env_secs("NOTIFY_CREDENTIAL_POLL_SECS")? {
            config.credential_poll_interval = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        self.endpoint_url("probe")?;
        self.retry_policy.validate()?;

        if self.credential_param.is_empty() {
            return Err(ChannelError::Configuration(
                "Credential query parameter must not be empty".to_string(),
            ));
        }

        if !self.destination.starts_with('/') {
            return Err(ChannelError::Configuration(format!(
                "Destination must be an absolute path, got {:?}",
                self.destination
            )));
        }

        if self.credential_poll_interval.is_zero() {
            return Err(ChannelError::Configuration(
                "Credential poll interval must be greater than 0".to_string(),
            ));
        }

        if self.hidden_grace_period.is_zero() {
            return Err(ChannelError::Configuration(
                "Hidden grace period must be greater than 0".to_string(),
            ));
        }

        if self.handshake_timeout.is_zero() {
            return Err(ChannelError::Configuration(
                "Handshake timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Derive the broker WebSocket URL for one connection attempt.
    ///
    /// `http` maps to `ws` and `https` to `wss`; the credential is appended as a
    /// percent-encoded query pair, keeping any query the base already has.
    pub fn endpoint_url(&self, credential: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ChannelError::Configuration(format!(
                    "Unsupported base URL scheme: {other}"
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            ChannelError::Configuration(format!("Cannot switch {} to {scheme}", self.base_url))
        })?;

        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.endpoint_path.trim_start_matches('/')
        );
        url.set_path(&path);
        url.set_fragment(None);
        url.query_pairs_mut()
            .append_pair(&self.credential_param, credential);

        Ok(url)
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn with_endpoint_path(mut self, path: impl Into<String>) -> Self {
        self.endpoint_path = path.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_credential_poll_interval(mut self, interval: Duration) -> Self {
        self.credential_poll_interval = interval;
        self
    }

    pub fn with_hidden_grace_period(mut self, grace: Duration) -> Self {
        self.hidden_grace_period = grace;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_heart_beat(mut self, heart_beat: HeartBeat) -> Self {
        self.heart_beat = heart_beat;
        self
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ChannelError::Configuration(format!("{name} must be whole seconds"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.retry_policy, RetryPolicy::Fixed(Duration::from_secs(10)));
        assert_eq!(config.credential_poll_interval, Duration::from_secs(5));
        assert_eq!(config.hidden_grace_period, Duration::from_secs(1));
        assert_eq!(config.destination, "/user/queue/notifications");
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case("http://api.example.com", "ws://api.example.com/ws?token=abc")]
    #[case("https://api.example.com", "wss://api.example.com/ws?token=abc")]
    #[case("https://api.example.com/", "wss://api.example.com/ws?token=abc")]
    #[case("https://api.example.com/api/", "wss://api.example.com/api/ws?token=abc")]
    #[case("http://localhost:8080?tenant=7", "ws://localhost:8080/ws?tenant=7&token=abc")]
    #[case("wss://push.example.com", "wss://push.example.com/ws?token=abc")]
    fn test_endpoint_url(#[case] base: &str, #[case] expected: &str) {
        let config = ChannelConfig::new(base);
        assert_eq!(config.endpoint_url("abc").unwrap().as_str(), expected);
    }

    #[test]
    fn test_endpoint_url_encodes_credential() {
        let config = ChannelConfig::new("https://api.example.com");
        let url = config.endpoint_url("a b&c=d").unwrap();
        let token = url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned());
        assert_eq!(token.as_deref(), Some("a b&c=d"));
        assert!(!url.as_str().contains("a b"));
    }

    #[test]
    fn test_endpoint_url_rejects_foreign_scheme() {
        let config = ChannelConfig::new("ftp://files.example.com");
        assert!(matches!(
            config.endpoint_url("abc"),
            Err(ChannelError::Configuration(_))
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let invalid = ChannelConfig::new("http://localhost").with_destination("queue");
        assert!(invalid.validate().is_err());

        let invalid = ChannelConfig::new("http://localhost")
            .with_retry_policy(RetryPolicy::Fixed(Duration::ZERO));
        assert!(invalid.validate().is_err());

        let invalid = ChannelConfig::new("http://localhost").with_retry_policy(
            RetryPolicy::Exponential {
                initial: Duration::from_secs(10),
                max: Duration::from_secs(1),
            },
        );
        assert!(invalid.validate().is_err());

        let invalid =
            ChannelConfig::new("http://localhost").with_hidden_grace_period(Duration::ZERO);
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_retry_policy_delays() {
        let fixed = RetryPolicy::Fixed(Duration::from_secs(10));
        assert_eq!(fixed.delay(0), Duration::from_secs(10));
        assert_eq!(fixed.delay(50), Duration::from_secs(10));

        let exp = RetryPolicy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(exp.delay(0), Duration::from_secs(1));
        assert_eq!(exp.delay(3), Duration::from_secs(8));
        assert_eq!(exp.delay(5), Duration::from_secs(30));
        assert_eq!(exp.delay(64), Duration::from_secs(30));
    }

    #[test]
    fn test_config_presets() {
        let fast = ChannelConfig::fast_recovery("http://localhost");
        assert_eq!(fast.retry_policy, RetryPolicy::Fixed(Duration::from_secs(2)));
        assert!(fast.validate().is_ok());

        let headless = ChannelConfig::headless_service("http://localhost");
        assert!(matches!(headless.retry_policy, RetryPolicy::Exponential { .. }));
        assert!(headless.validate().is_ok());
    }

    /// Only test touching `NOTIFY_*` broker variables, so it runs the cases in
    /// sequence
    #[test]
    fn test_config_from_env() {
        const VARS: [&str; 4] = [
            "NOTIFY_BROKER_URL",
            "NOTIFY_DESTINATION",
            "NOTIFY_RETRY_SECS",
            "NOTIFY_CREDENTIAL_POLL_SECS",
        ];
        for var in VARS {
            std::env::remove_var(var);
        }

        let missing = ChannelConfig::from_env();
        assert!(matches!(
            missing,
            Err(ChannelError::Configuration(ref message)) if message.contains("NOTIFY_BROKER_URL")
        ));

        std::env::set_var("NOTIFY_BROKER_URL", "https://api.example.com");
        std::env::set_var("NOTIFY_DESTINATION", "/topic/all");
        std::env::set_var("NOTIFY_RETRY_SECS", " 3 ");
        std::env::set_var("NOTIFY_CREDENTIAL_POLL_SECS", "7");
        let config = ChannelConfig::from_env().unwrap();
        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.destination, "/topic/all");
        assert_eq!(config.retry_policy, RetryPolicy::Fixed(Duration::from_secs(3)));
        assert_eq!(config.credential_poll_interval, Duration::from_secs(7));

        std::env::set_var("NOTIFY_RETRY_SECS", "ten");
        assert!(matches!(
            ChannelConfig::from_env(),
            Err(ChannelError::Configuration(ref message)) if message.contains("NOTIFY_RETRY_SECS")
        ));

        std::env::set_var("NOTIFY_RETRY_SECS", "0");
        assert!(ChannelConfig::from_env().is_err());

        for var in VARS {
            std::env::remove_var(var);
        }
    }
}
