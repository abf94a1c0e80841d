//! Authenticated russh session exposed as a [`Transport`]

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use russh::client::Handle;
use russh::Disconnect;
use tokio::sync::{mpsc, RwLock};

use gotssh_core::{ConnectionError, Endpoint};

use super::handler::{ClientHandler, RemoteRoutes};
use super::map_russh_error;
use crate::transport::{BoxedStream, RemoteListener, Transport};

/// Forwarded connections queued per remote listener before the relay
/// picks them up.
const REMOTE_BACKLOG: usize = 64;

pub struct SshTransport {
    /// Channel opens share the read lock; global requests take the write lock
    handle: RwLock<Handle<ClientHandler>>,
    routes: RemoteRoutes,
    server: Endpoint,
    closed: AtomicBool,
}

impl SshTransport {
    pub(crate) fn new(handle: Handle<ClientHandler>, routes: RemoteRoutes, server: Endpoint) -> Self {
        Self {
            handle: RwLock::new(handle),
            routes,
            server,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_direct(
        &self,
        target: &Endpoint,
        originator: &Endpoint,
    ) -> Result<BoxedStream, ConnectionError> {
        self.ensure_open()?;
        let handle = self.handle.read().await;
        let channel = handle
            .channel_open_direct_tcpip(
                target.host.clone(),
                u32::from(target.port),
                originator.host.clone(),
                u32::from(originator.port),
            )
            .await
            .map_err(map_russh_error)?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen_remote(&self, bind: &Endpoint) -> Result<RemoteListener, ConnectionError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(REMOTE_BACKLOG);

        let allocated = {
            let mut handle = self.handle.write().await;
            handle
                .tcpip_forward(bind.host.clone(), u32::from(bind.port))
                .await
                .map_err(map_russh_error)?
        };
        let port = match bind.port {
            0 => u16::try_from(allocated).map_err(|_| {
                ConnectionError::Refused(format!("server allocated invalid port {}", allocated))
            })?,
            port => port,
        };

        let bound = Endpoint::new(bind.host.clone(), port);
        self.routes.insert(&bound, tx);
        tracing::debug!("{} listening on {}", self.server, bound);
        Ok(RemoteListener { bound, incoming: rx })
    }

    async fn cancel_remote(&self, listener: RemoteListener) -> Result<(), ConnectionError> {
        let RemoteListener { bound, incoming } = listener;
        drop(incoming);
        self.routes.release(&bound);
        self.ensure_open()?;
        let handle = self.handle.write().await;
        handle
            .cancel_tcpip_forward(bound.host.clone(), u32::from(bound.port))
            .await
            .map(|_| ())
            .map_err(map_russh_error)
    }

    fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.handle.try_read() {
            Ok(handle) => !handle.is_closed(),
            // a request holds the lock, so the session was usable a moment ago
            Err(_) => true,
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.routes.clear();
        let handle = self.handle.write().await;
        if handle.is_closed() {
            return Ok(());
        }
        tracing::debug!("Closing session to {}", self.server);
        handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
            .map_err(map_russh_error)
    }
}
