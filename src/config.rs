//! Session configuration.
//!
//! Every field has a default so a session can run with no configuration at all.
//! A TOML file may override any subset of fields, and `FLUUX_*` environment
//! variables override the file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// What an account does when its live transport goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLossPolicy {
    /// Reconnect with backoff unless the target presence is offline.
    Reconnect,
    /// Tear the account down and forget its session.
    Remove,
}

impl std::str::FromStr for SessionLossPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reconnect" => Ok(Self::Reconnect),
            "remove" => Ok(Self::Remove),
            other => Err(format!("unknown session-loss policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on request/response round trips.
    /// Env: `FLUUX_REQUEST_TIMEOUT_SECS`
    #[serde(with = "secs")]
    pub request_timeout: Duration,

    /// Env: `FLUUX_SESSION_LOSS` (`reconnect` or `remove`)
    pub session_loss: SessionLossPolicy,

    /// First reconnect delay; doubles per attempt up to `reconnect_max_delay`.
    /// Env: `FLUUX_RECONNECT_BASE_MS`
    #[serde(with = "millis")]
    pub reconnect_base_delay: Duration,

    #[serde(with = "millis")]
    pub reconnect_max_delay: Duration,

    /// Consecutive failed reconnects before the account is torn down (0 = unlimited).
    /// Env: `FLUUX_MAX_RECONNECT_ATTEMPTS`
    pub max_reconnect_attempts: u32,

    /// Env: `FLUUX_TCP_CONNECT_TIMEOUT_SECS`
    #[serde(with = "secs")]
    pub tcp_connect_timeout: Duration,

    /// Silence on the stream after which the transport is considered dead.
    #[serde(with = "secs")]
    pub inactivity_timeout: Duration,

    /// Interval between keepalive pings on stream transports.
    #[serde(with = "secs")]
    pub ping_interval: Duration,

    /// Upper bound on buffered bytes that have not yet formed a stanza.
    pub max_stanza_buffer: usize,

    /// Entity-capabilities node advertised with presence.
    pub caps_node: String,

    /// Skip TLS certificate verification. Development only.
    /// Env: `FLUUX_DANGEROUS_INSECURE_TLS`
    pub dangerous_insecure_tls: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            session_loss: SessionLossPolicy::Reconnect,
            reconnect_base_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            tcp_connect_timeout: Duration::from_secs(15),
            inactivity_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(60),
            max_stanza_buffer: 1_024 * 1_024,
            caps_node: "https://fluux.io".to_string(),
            dangerous_insecure_tls: false,
        }
    }
}

impl SessionConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&raw)?;
        config.with_env_overrides()
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(val) = lookup("FLUUX_REQUEST_TIMEOUT_SECS") {
            self.request_timeout = Duration::from_secs(parse_env("FLUUX_REQUEST_TIMEOUT_SECS", &val)?);
        }

        if let Some(val) = lookup("FLUUX_SESSION_LOSS") {
            self.session_loss = val.parse().map_err(|_| ConfigError::Env {
                key: "FLUUX_SESSION_LOSS".to_string(),
                value: val.clone(),
            })?;
        }

        if let Some(val) = lookup("FLUUX_RECONNECT_BASE_MS") {
            self.reconnect_base_delay = Duration::from_millis(parse_env("FLUUX_RECONNECT_BASE_MS", &val)?);
        }

        if let Some(val) = lookup("FLUUX_MAX_RECONNECT_ATTEMPTS") {
            self.max_reconnect_attempts = parse_env("FLUUX_MAX_RECONNECT_ATTEMPTS", &val)?;
        }

        if let Some(val) = lookup("FLUUX_TCP_CONNECT_TIMEOUT_SECS") {
            self.tcp_connect_timeout = Duration::from_secs(parse_env("FLUUX_TCP_CONNECT_TIMEOUT_SECS", &val)?);
        }

        if let Some(val) = lookup("FLUUX_DANGEROUS_INSECURE_TLS") {
            self.dangerous_insecure_tls = val != "false" && val != "0";
            if self.dangerous_insecure_tls {
                warn!("TLS certificate verification disabled through FLUUX_DANGEROUS_INSECURE_TLS");
            }
        }

        Ok(self)
    }

    /// Delay before reconnect attempt `attempt` (0-based): base * 2^attempt, capped.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
