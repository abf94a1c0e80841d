//! Remote forwards: the server listens, we connect out locally

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use gotssh_core::{ConnectionError, Endpoint, ForwardError};
use gotssh_tunnel::{ForwardedChannel, RemoteListener};

use super::relay::{pipe, upgrade, Relay, Started, TransportLink};

pub(crate) struct RemoteRelay {
    bind: Endpoint,
    target: Endpoint,
}

impl RemoteRelay {
    pub(crate) fn new(bind: Endpoint, target: Endpoint) -> Self {
        Self { bind, target }
    }
}

#[async_trait]
impl Relay for RemoteRelay {
    async fn start(
        &self,
        link: TransportLink,
        cancel: CancellationToken,
    ) -> Result<Started, ForwardError> {
        let listener = {
            let transport = upgrade(&link)?;
            transport
                .listen_remote(&self.bind)
                .await
                .map_err(|e| match e {
                    ConnectionError::Refused(reason) => ForwardError::Bind {
                        addr: self.bind.to_string(),
                        reason,
                    },
                    other => ForwardError::Channel(other),
                })?
        };
        let bound = listener.bound.clone();
        tracing::info!(bind = %bound, target = %self.target, "Remote forward listening");
        let task = tokio::spawn(accept_loop(listener, self.target.clone(), link, cancel));
        Ok(Started { bound, task })
    }
}

async fn accept_loop(
    mut listener: RemoteListener,
    target: Endpoint,
    link: TransportLink,
    cancel: CancellationToken,
) {
    let bound = listener.bound.clone();
    let cancelled = loop {
        tokio::select! {
            _ = cancel.cancelled() => break true,
            incoming = listener.incoming.recv() => match incoming {
                Some(forwarded) => {
                    let target = target.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = relay_connection(forwarded, &target, cancel).await {
                            tracing::warn!(%target, "Remote forward connection failed: {}", e);
                        }
                    });
                }
                // the transport dropped our route
                None => break false,
            }
        }
    };

    if cancelled {
        withdraw(listener, &link).await;
    }
    tracing::debug!(%bound, "Remote forward listener closed");
}

/// Ask the server to stop listening, unless the transport is already gone
async fn withdraw(listener: RemoteListener, link: &TransportLink) {
    let Some(transport) = link.upgrade() else {
        return;
    };
    if !transport.is_alive() {
        return;
    }
    let bound = listener.bound.clone();
    if let Err(e) = transport.cancel_remote(listener).await {
        tracing::debug!(%bound, "Cancelling remote listener failed: {}", e);
    }
}

async fn relay_connection(
    forwarded: ForwardedChannel,
    target: &Endpoint,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    tracing::debug!(originator = %forwarded.originator, %target, "Forwarded connection");
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        stream = TcpStream::connect((target.host.as_str(), target.port)) => stream?,
    };
    stream.set_nodelay(true).ok();
    pipe(forwarded.stream, stream, cancel).await;
    Ok(())
}
