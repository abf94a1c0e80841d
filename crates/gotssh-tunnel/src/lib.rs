//! gotssh-tunnel: the transport layer under the connection manager
//!
//! Provides:
//! - The [`Transport`] and [`Connector`] seams the manager drives
//! - A russh-backed implementation in [`ssh`]
//! - SOCKS5 negotiation for dynamic forwards and proxied dials
//! - Exponential backoff for connect retries

pub mod reconnect;
pub mod socks;
pub mod ssh;
pub mod transport;

pub use reconnect::ExponentialBackoff;
pub use ssh::{SshConnector, SshSettings};
pub use transport::{
    BoxedStream, ChannelIo, Connector, ForwardedChannel, PendingAuth, RemoteListener, Transport,
};
