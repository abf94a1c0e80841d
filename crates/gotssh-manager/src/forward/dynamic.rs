//! Dynamic forwards: a local SOCKS5 endpoint, each CONNECT opened through the server

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use gotssh_core::{ConnectionError, Endpoint, ForwardError};
use gotssh_tunnel::socks::{self, Reply};

use super::relay::{bind_local, pipe, upgrade, Relay, Started, TransportLink};

pub(crate) struct DynamicRelay {
    bind: Endpoint,
}

impl DynamicRelay {
    pub(crate) fn new(bind: Endpoint) -> Self {
        Self { bind }
    }
}

#[async_trait]
impl Relay for DynamicRelay {
    async fn start(
        &self,
        link: TransportLink,
        cancel: CancellationToken,
    ) -> Result<Started, ForwardError> {
        let (listener, bound) = bind_local(&self.bind).await?;
        tracing::info!(bind = %bound, "SOCKS5 forward listening");
        let task = tokio::spawn(accept_loop(listener, link, cancel));
        Ok(Started { bound, task })
    }
}

async fn accept_loop(listener: TcpListener, link: TransportLink, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, origin)) => {
                    let link = link.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = relay_connection(stream, origin, &link, cancel).await {
                            tracing::warn!(%origin, "SOCKS5 connection failed: {}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!("SOCKS5 accept error: {}", e),
            }
        }
    }
    tracing::debug!("SOCKS5 listener closed");
}

fn reply_for(error: &ConnectionError) -> Reply {
    match error {
        ConnectionError::Refused(_) => Reply::ConnectionRefused,
        ConnectionError::Network(_) | ConnectionError::Timeout { .. } => Reply::HostUnreachable,
        _ => Reply::GeneralFailure,
    }
}

async fn relay_connection(
    mut stream: TcpStream,
    origin: SocketAddr,
    link: &TransportLink,
    cancel: CancellationToken,
) -> Result<(), ForwardError> {
    stream.set_nodelay(true).ok();
    let target = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        target = socks::accept(&mut stream) => target.map_err(|e| ForwardError::Socks(e.to_string()))?,
    };
    tracing::debug!(%origin, %target, "SOCKS5 CONNECT");

    let originator = Endpoint::new(origin.ip().to_string(), origin.port());
    let opened = match upgrade(link) {
        Ok(transport) => tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            channel = transport.open_direct(&target, &originator) => channel,
        },
        Err(e) => Err(e),
    };

    let channel = match opened {
        Ok(channel) => channel,
        Err(e) => {
            let _ = socks::send_reply(&mut stream, reply_for(&e)).await;
            return Err(e.into());
        }
    };
    socks::send_reply(&mut stream, Reply::Succeeded)
        .await
        .map_err(|e| ForwardError::Socks(e.to_string()))?;

    pipe(stream, channel, cancel).await;
    Ok(())
}
