//! Connection manager configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::types::{DEFAULT_PORT, DEFAULT_USER};

/// Configuration for the connection manager and its sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Login used when a target omits `user@`
    pub default_user: String,

    /// Port used when a target omits `:port`
    pub default_port: u16,

    /// Limit for the TCP dial and SSH key exchange of one attempt
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Limit for the authentication handshake of one attempt
    #[serde(with = "duration_secs")]
    pub auth_timeout: Duration,

    /// Interval between SSH protocol keep-alives
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// How often the health monitor checks each transport
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,

    /// Connect attempts (including the first) for transient failures
    pub max_attempts: u32,

    /// Reconnect in the background when an active transport dies
    pub auto_reconnect: bool,

    /// Server host key verification
    pub host_key: HostKeyPolicy,

    /// Backoff between connect attempts
    pub backoff: BackoffConfig,

    /// Dial the SSH server through a SOCKS5 proxy
    pub proxy: Option<ProxyConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_user: DEFAULT_USER.to_string(),
            default_port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
            max_attempts: 3,
            auto_reconnect: true,
            host_key: HostKeyPolicy::default(),
            backoff: BackoffConfig::default(),
            proxy: None,
        }
    }
}

impl ManagerConfig {
    /// Reject values the manager cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("auth_timeout", self.auth_timeout),
            ("health_check_interval", self.health_check_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        self.backoff.validate()?;
        if let Some(proxy) = &self.proxy {
            if proxy.host.is_empty() {
                return Err(ConfigError::Invalid("proxy.host must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the second attempt
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Upper bound on any single delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid("backoff.jitter must be within 0.0..=1.0".into()));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::Invalid("backoff.multiplier must be >= 1.0".into()));
        }
        if self.max < self.initial {
            return Err(ConfigError::Invalid("backoff.max must be >= backoff.initial".into()));
        }
        Ok(())
    }
}

/// How server host keys are checked
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any key
    #[default]
    AcceptAny,
    /// Accept only this fingerprint (`SHA256:...`)
    Fingerprint(String),
    /// Consult the user's `~/.ssh/known_hosts`
    KnownHosts,
}

/// SOCKS5 proxy used to reach the SSH server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}
