//! Relay trait and the plumbing shared by every forward direction

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use gotssh_core::{ConnectionError, Endpoint, ForwardError, ForwardSpec};
use gotssh_tunnel::Transport;

use super::dynamic::DynamicRelay;
use super::local::LocalRelay;
use super::remote::RemoteRelay;

/// Weak handle to a session transport. Relays never keep a transport alive.
pub(crate) type TransportLink = Weak<dyn Transport>;

/// A relay whose accept loop is running
pub(crate) struct Started {
    /// Endpoint actually bound
    pub(crate) bound: Endpoint,
    /// The accept loop. It finishes only after its listener is released.
    pub(crate) task: JoinHandle<()>,
}

/// One direction of port forwarding.
#[async_trait]
pub(crate) trait Relay: Send + Sync {
    /// Claim the bind endpoint and spawn the accept loop.
    ///
    /// The loop, and every connection it relays, stops when `cancel` fires.
    async fn start(
        &self,
        link: TransportLink,
        cancel: CancellationToken,
    ) -> Result<Started, ForwardError>;
}

pub(crate) fn relay_for(spec: &ForwardSpec) -> Box<dyn Relay> {
    match spec {
        ForwardSpec::Local { bind, target } => Box::new(LocalRelay::new(bind.clone(), target.clone())),
        ForwardSpec::Remote { bind, target } => {
            Box::new(RemoteRelay::new(bind.clone(), target.clone()))
        }
        ForwardSpec::Dynamic { bind } => Box::new(DynamicRelay::new(bind.clone())),
    }
}

pub(crate) fn upgrade(link: &TransportLink) -> Result<Arc<dyn Transport>, ConnectionError> {
    link.upgrade().ok_or(ConnectionError::Closed)
}

/// Bind a local listener, mapping failures to [`ForwardError::Bind`].
pub(crate) async fn bind_local(bind: &Endpoint) -> Result<(TcpListener, Endpoint), ForwardError> {
    let bind_error = |e: std::io::Error| ForwardError::Bind {
        addr: bind.to_string(),
        reason: e.to_string(),
    };
    let listener = TcpListener::bind((bind.host.as_str(), bind.port))
        .await
        .map_err(bind_error)?;
    let port = listener.local_addr().map_err(bind_error)?.port();
    Ok((listener, Endpoint::new(bind.host.clone(), port)))
}

/// Copy bytes both ways until either side closes or `cancel` fires.
pub(crate) async fn pipe<A, B>(mut a: A, mut b: B, cancel: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = copy_bidirectional(&mut a, &mut b) => match result {
            Ok((up, down)) => tracing::trace!(up, down, "Relay finished"),
            Err(e) => tracing::debug!("Relay ended: {}", e),
        },
        _ = cancel.cancelled() => tracing::trace!("Relay cancelled"),
    }
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
}
