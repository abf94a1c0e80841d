//! russh-backed [`Connector`] and [`Transport`]

mod auth;
mod handler;
mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use tokio::net::TcpStream;
use tokio::time::timeout;

use gotssh_core::config::{HostKeyPolicy, ManagerConfig, ProxyConfig};
use gotssh_core::{AuthMethod, ConnectionError, Endpoint, SessionTarget};

use crate::socks;
use crate::transport::{Connector, PendingAuth, Transport};
use handler::{ClientHandler, RemoteRoutes};

pub use session::SshTransport;

/// Settings for dialing SSH servers
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Limit for the TCP dial, then again for the key exchange
    pub connect_timeout: Duration,
    /// Protocol keep-alive interval; zero disables keep-alives
    pub keepalive_interval: Duration,
    pub host_key: HostKeyPolicy,
    pub proxy: Option<ProxyConfig>,
}

impl SshSettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            keepalive_interval: config.keepalive_interval,
            host_key: config.host_key.clone(),
            proxy: config.proxy.clone(),
        }
    }
}

/// Dials SSH servers, directly or through a SOCKS5 proxy
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    async fn dial(&self, server: &Endpoint) -> Result<TcpStream, ConnectionError> {
        let stream = match &self.settings.proxy {
            Some(proxy) => socks::connect_via(proxy, server)
                .await
                .map_err(|e| match e {
                    socks::SocksError::AuthRejected => {
                        ConnectionError::Auth(format!("proxy {}: {}", proxy.host, e))
                    }
                    e => ConnectionError::Network(format!("proxy {}: {}", proxy.host, e)),
                })?,
            None => TcpStream::connect((server.host.as_str(), server.port)).await?,
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn handshake(
        &self,
        target: &SessionTarget,
    ) -> Result<Box<dyn PendingAuth>, ConnectionError> {
        let server = target.endpoint();
        let limit = self.settings.connect_timeout;

        tracing::debug!("Connecting to {}", server);
        let stream = timeout(limit, self.dial(&server))
            .await
            .map_err(|_| ConnectionError::Timeout {
                stage: "dial",
                after: limit,
            })??;

        let config = Arc::new(Config {
            keepalive_interval: (!self.settings.keepalive_interval.is_zero())
                .then_some(self.settings.keepalive_interval),
            ..Default::default()
        });
        let routes = RemoteRoutes::default();
        let handler = ClientHandler::new(
            server.clone(),
            self.settings.host_key.clone(),
            Arc::clone(&routes),
        );

        let handle = timeout(limit, client::connect_stream(config, stream, handler))
            .await
            .map_err(|_| ConnectionError::Timeout {
                stage: "key exchange",
                after: limit,
            })?
            .map_err(handshake_error)?;

        tracing::debug!("Key exchange with {} complete", server);
        Ok(Box::new(SshPendingAuth {
            handle,
            routes,
            server,
        }))
    }
}

struct SshPendingAuth {
    handle: Handle<ClientHandler>,
    routes: RemoteRoutes,
    server: Endpoint,
}

#[async_trait]
impl PendingAuth for SshPendingAuth {
    async fn authenticate(
        self: Box<Self>,
        user: &str,
        method: &AuthMethod,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        let SshPendingAuth {
            mut handle,
            routes,
            server,
        } = *self;

        tracing::debug!("Authenticating as '{}' with {}", user, method.kind());
        if !auth::authenticate(&mut handle, user, method).await? {
            return Err(ConnectionError::Auth(format!(
                "{} rejected {} authentication for '{}'",
                server,
                method.kind(),
                user
            )));
        }

        Ok(Box::new(SshTransport::new(handle, routes, server)))
    }
}

/// Classify an error returned by the russh handshake.
fn handshake_error(e: anyhow::Error) -> ConnectionError {
    let e = match e.downcast::<ConnectionError>() {
        Ok(rejected) => return rejected,
        Err(e) => e,
    };
    match e.downcast::<russh::Error>() {
        Ok(e) => map_russh_error(e),
        Err(e) => ConnectionError::Network(e.to_string()),
    }
}

pub(crate) fn map_russh_error(e: russh::Error) -> ConnectionError {
    match e {
        russh::Error::UnknownKey => {
            ConnectionError::HostKeyRejected("server host key was not accepted".into())
        }
        russh::Error::IO(e) => e.into(),
        russh::Error::ChannelOpenFailure(reason) => {
            ConnectionError::Refused(format!("channel open failed: {:?}", reason))
        }
        russh::Error::RequestDenied => ConnectionError::Refused("request denied".into()),
        russh::Error::Disconnect | russh::Error::SendError => ConnectionError::Closed,
        other => ConnectionError::Network(other.to_string()),
    }
}
