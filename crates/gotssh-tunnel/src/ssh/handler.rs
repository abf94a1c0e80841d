//! russh client handler: host key policy and forwarded-tcpip routing

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client::{self, Msg, Session};
use russh::Channel;
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;

use gotssh_core::config::HostKeyPolicy;
use gotssh_core::{ConnectionError, Endpoint};

use crate::transport::ForwardedChannel;

pub(crate) type RemoteRoutes = Arc<RouteTable>;

/// Server-side listeners, keyed by the address the server bound
#[derive(Default)]
pub(crate) struct RouteTable {
    routes: DashMap<(String, u16), mpsc::Sender<ForwardedChannel>>,
}

impl RouteTable {
    pub(crate) fn insert(&self, bound: &Endpoint, tx: mpsc::Sender<ForwardedChannel>) {
        self.routes.insert((bound.host.clone(), bound.port), tx);
    }

    /// Sender for a `forwarded-tcpip` open. Falls back to a port-only match
    /// for servers that report a normalized listen address.
    pub(crate) fn lookup(&self, host: &str, port: u16) -> Option<mpsc::Sender<ForwardedChannel>> {
        if let Some(tx) = self.routes.get(&(host.to_string(), port)) {
            return Some(tx.value().clone());
        }
        self.routes
            .iter()
            .find(|entry| entry.key().1 == port)
            .map(|entry| entry.value().clone())
    }

    /// Drop the route for `bound` once its receiver is gone. A route a newer
    /// listener installed on the same address is left alone.
    pub(crate) fn release(&self, bound: &Endpoint) {
        self.routes
            .remove_if(&(bound.host.clone(), bound.port), |_, tx| tx.is_closed());
    }

    pub(crate) fn clear(&self) {
        self.routes.clear();
    }
}

pub(crate) struct ClientHandler {
    server: Endpoint,
    policy: HostKeyPolicy,
    routes: RemoteRoutes,
}

impl ClientHandler {
    pub(crate) fn new(server: Endpoint, policy: HostKeyPolicy, routes: RemoteRoutes) -> Self {
        Self {
            server,
            policy,
            routes,
        }
    }
}

fn strip_hash_prefix(fingerprint: &str) -> &str {
    fingerprint.strip_prefix("SHA256:").unwrap_or(fingerprint)
}

/// Check `key` against `policy`, returning the rejection reason if any.
pub(crate) fn verify_host_key(
    policy: &HostKeyPolicy,
    server: &Endpoint,
    key: &PublicKey,
) -> Result<(), String> {
    let fingerprint = key.fingerprint();
    match policy {
        HostKeyPolicy::AcceptAny => Ok(()),
        HostKeyPolicy::Fingerprint(expected) => {
            if strip_hash_prefix(&fingerprint) == strip_hash_prefix(expected) {
                Ok(())
            } else {
                Err(format!(
                    "{} presented SHA256:{}, expected {}",
                    server,
                    strip_hash_prefix(&fingerprint),
                    expected
                ))
            }
        }
        HostKeyPolicy::KnownHosts => {
            match russh_keys::check_known_hosts(&server.host, server.port, key) {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!("{} is not in known_hosts", server)),
                Err(e) => Err(format!("known_hosts check for {} failed: {}", server, e)),
            }
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Host key for {}: {}",
            self.server,
            server_public_key.fingerprint()
        );

        match verify_host_key(&self.policy, &self.server, server_public_key) {
            Ok(()) => Ok(true),
            Err(reason) => {
                tracing::warn!("Rejecting host key: {}", reason);
                Err(ConnectionError::HostKeyRejected(reason).into())
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let route = u16::try_from(connected_port)
            .ok()
            .and_then(|port| self.routes.lookup(connected_address, port));

        let Some(tx) = route else {
            tracing::warn!(
                "Dropping forwarded connection for unknown listener {}:{}",
                connected_address,
                connected_port
            );
            return Ok(());
        };

        let forwarded = ForwardedChannel {
            stream: Box::new(channel.into_stream()),
            originator: Endpoint::new(originator_address, originator_port as u16),
        };
        if tx.send(forwarded).await.is_err() {
            tracing::debug!("Listener for port {} is gone", connected_port);
        }
        Ok(())
    }
}
