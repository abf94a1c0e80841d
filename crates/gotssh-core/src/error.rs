//! Core error types for gotssh

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::state::SessionState;
use crate::types::{RuleId, SessionAlias};

/// Top-level error type for the gotssh workspace
#[derive(Error, Debug)]
pub enum GotsshError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Forwarding error
    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while establishing or using a session transport
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Transient network failure (refused, reset, unreachable, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// The server rejected our credentials, or they could not be loaded
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A stage of the connection did not finish in time
    #[error("Timed out during {stage} after {after:?}")]
    Timeout {
        stage: &'static str,
        after: Duration,
    },

    /// Host key verification failed
    #[error("Host key verification failed: {0}")]
    HostKeyRejected(String),

    /// The server refused a channel open or global request
    #[error("Refused by server: {0}")]
    Refused(String),

    /// The transport has already been closed
    #[error("Transport closed")]
    Closed,

    /// The operation was cancelled by a disconnect
    #[error("Operation cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// Whether a connect attempt failing with this error may be retried.
    ///
    /// Only network failures and timeouts qualify; authentication and
    /// host key failures need user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout { .. })
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Registry and state machine errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session is registered under this alias
    #[error("Session not found: {0}")]
    NotFound(SessionAlias),

    /// A session with this alias is already registered
    #[error("Session alias already in use: {0}")]
    DuplicateAlias(SessionAlias),

    /// The state machine does not allow this transition
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// Port forwarding errors
#[derive(Error, Debug)]
pub enum ForwardError {
    /// Forwards need an authenticated or active session
    #[error("Session {alias} is {state}, forwards require an authenticated session")]
    SessionNotActive {
        alias: SessionAlias,
        state: SessionState,
    },

    /// The bind endpoint could not be claimed (locally or on the server)
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// No rule with this id on the session
    #[error("Forward rule {rule} not found on session {alias}")]
    RuleNotFound { alias: SessionAlias, rule: RuleId },

    /// Opening a channel over the transport failed
    #[error("Channel error: {0}")]
    Channel(#[from] ConnectionError),

    /// SOCKS negotiation failed
    #[error("SOCKS error: {0}")]
    Socks(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Reading or writing the config file failed
    #[error("Config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors from parsing endpoints, targets and forward specs
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed `host:port`
    #[error("Invalid endpoint '{0}'")]
    Endpoint(String),

    /// Port is not a number in 0..=65535
    #[error("Invalid port '{0}'")]
    Port(String),

    /// Malformed `user@host:port`
    #[error("Invalid target '{0}': {1}")]
    Target(String, &'static str),

    /// Malformed forward specification
    #[error("Invalid forward spec '{0}': {1}")]
    Forward(String, &'static str),
}
