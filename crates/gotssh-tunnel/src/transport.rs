//! Transport abstraction
//!
//! A [`Connector`] dials and runs the key exchange, yielding a
//! [`PendingAuth`]. Authenticating that produces a [`Transport`], the
//! multiplexed connection every forward of a session rides on.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use gotssh_core::{AuthMethod, ConnectionError, Endpoint, SessionTarget};

/// Byte stream carried by a transport channel
pub trait ChannelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Owned, type-erased channel stream
pub type BoxedStream = Box<dyn ChannelIo>;

/// A channel the server opened towards us for a remote forward
pub struct ForwardedChannel {
    pub stream: BoxedStream,
    /// Peer that connected to the server-side listener
    pub originator: Endpoint,
}

/// A server-side listener registered with [`Transport::listen_remote`]
pub struct RemoteListener {
    /// Address the server actually bound (port resolved if 0 was requested)
    pub bound: Endpoint,
    pub incoming: mpsc::Receiver<ForwardedChannel>,
}

/// An authenticated, multiplexed connection to one server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel to `target`, as seen from the server
    async fn open_direct(
        &self,
        target: &Endpoint,
        originator: &Endpoint,
    ) -> Result<BoxedStream, ConnectionError>;

    /// Ask the server to listen on `bind` and hand us its connections
    async fn listen_remote(&self, bind: &Endpoint) -> Result<RemoteListener, ConnectionError>;

    /// Withdraw a listener created by [`Transport::listen_remote`].
    ///
    /// Returns once the server has stopped listening, so the address can be
    /// claimed again right away.
    async fn cancel_remote(&self, listener: RemoteListener) -> Result<(), ConnectionError>;

    /// Whether the connection is still usable
    fn is_alive(&self) -> bool;

    /// Close the connection. Open channels are torn down with it.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Dials a server and completes the key exchange
#[async_trait]
pub trait Connector: Send + Sync {
    async fn handshake(
        &self,
        target: &SessionTarget,
    ) -> Result<Box<dyn PendingAuth>, ConnectionError>;
}

/// A connection that finished key exchange but is not yet authenticated
#[async_trait]
pub trait PendingAuth: Send {
    async fn authenticate(
        self: Box<Self>,
        user: &str,
        auth: &AuthMethod,
    ) -> Result<Box<dyn Transport>, ConnectionError>;
}
