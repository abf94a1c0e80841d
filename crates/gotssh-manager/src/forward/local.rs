//! Local forwards: listen here, connect out from the server

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use gotssh_core::{ConnectionError, Endpoint, ForwardError};

use super::relay::{bind_local, pipe, upgrade, Relay, Started, TransportLink};

pub(crate) struct LocalRelay {
    bind: Endpoint,
    target: Endpoint,
}

impl LocalRelay {
    pub(crate) fn new(bind: Endpoint, target: Endpoint) -> Self {
        Self { bind, target }
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn start(
        &self,
        link: TransportLink,
        cancel: CancellationToken,
    ) -> Result<Started, ForwardError> {
        let (listener, bound) = bind_local(&self.bind).await?;
        tracing::info!(bind = %bound, target = %self.target, "Local forward listening");
        let task = tokio::spawn(accept_loop(listener, self.target.clone(), link, cancel));
        Ok(Started { bound, task })
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: Endpoint,
    link: TransportLink,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, origin)) => {
                    let target = target.clone();
                    let link = link.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = relay_connection(stream, origin, &target, &link, cancel).await {
                            tracing::warn!(%target, "Local forward connection failed: {}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Local forward accept error: {}", e),
            }
        }
    }
    tracing::debug!("Local forward listener closed");
}

async fn relay_connection(
    stream: TcpStream,
    origin: SocketAddr,
    target: &Endpoint,
    link: &TransportLink,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    stream.set_nodelay(true).ok();
    let originator = Endpoint::new(origin.ip().to_string(), origin.port());

    let channel = {
        let transport = upgrade(link)?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
            channel = transport.open_direct(target, &originator) => channel?,
        }
    };

    pipe(stream, channel, cancel).await;
    Ok(())
}
