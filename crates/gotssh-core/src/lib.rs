//! gotssh-core: Core abstractions and configuration for gotssh
//!
//! This crate provides the domain types, the session state machine, the
//! error taxonomy and the configuration structures shared by the tunnel
//! and manager crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod state;
pub mod types;

pub use error::{
    ConfigError, ConnectionError, ForwardError, GotsshError, ParseError, SessionError,
};
pub use state::SessionState;
pub use types::{AuthMethod, Endpoint, ForwardDirection, ForwardSpec, RuleId, SessionAlias, SessionTarget};
