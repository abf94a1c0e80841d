//! Connection manager: session lifecycle over a [`Connector`]

use std::sync::Arc;

use futures::future::join_all;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use gotssh_core::config::ManagerConfig;
use gotssh_core::{
    AuthMethod, ConnectionError, GotsshError, SessionAlias, SessionError, SessionState,
    SessionTarget,
};
use gotssh_tunnel::{Connector, ExponentialBackoff, Transport};

use crate::forward::ForwardEngine;
use crate::health;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionStatus};

/// Owns session lifecycles: connect, retry, disconnect, reconnect
pub struct ConnectionManager {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
    forwards: ForwardEngine,
    /// Parent of every session lifetime token
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            forwards: ForwardEngine::new(Arc::clone(&registry)),
            config,
            connector,
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn forwards(&self) -> &ForwardEngine {
        &self.forwards
    }

    /// Register a new session and bring it to `Active`.
    ///
    /// Transient failures are retried up to `max_attempts` times; auth and
    /// host key failures are returned at once. A session whose connect fails
    /// is not left in the registry.
    pub async fn connect(
        self: &Arc<Self>,
        alias: impl Into<SessionAlias>,
        target: SessionTarget,
        auth: AuthMethod,
    ) -> Result<Arc<Session>, GotsshError> {
        let alias = alias.into();
        let session = Arc::new(Session::new(
            alias.clone(),
            target,
            auth,
            self.shutdown.child_token(),
        ));
        // taken before the session becomes visible in the registry
        let op = session.lock_ops().await;
        self.registry.register(Arc::clone(&session))?;

        tracing::info!(%alias, target = %session.target(), auth = session.auth().kind(), "Connecting");
        let result = self.establish(&session).await;
        if result.is_err() {
            self.registry.remove_entry(&session);
            session.lifetime().cancel();
        }
        drop(op);

        result?;
        health::spawn_monitor(self, &session);
        Ok(session)
    }

    /// Close the transport and stop every forward. The session stays
    /// registered in `Disconnected` with its rules kept inactive.
    pub async fn disconnect(&self, alias: &SessionAlias) -> Result<(), GotsshError> {
        let session = self.registry.get(alias)?;
        self.shut_down(&session).await
    }

    async fn shut_down(&self, session: &Session) -> Result<(), GotsshError> {
        session.abort_attempt();
        let _op = session.lock_ops().await;

        let transport = session.mark_disconnected()?;
        if let Some(transport) = transport {
            close_transport(session.alias(), transport).await;
        }
        tracing::info!(alias = %session.alias(), "Disconnected");
        Ok(())
    }

    /// Re-establish the transport and re-activate inactive forwards.
    ///
    /// A session that is still up is disconnected first.
    pub async fn reconnect(&self, alias: &SessionAlias) -> Result<(), GotsshError> {
        let session = self.registry.get(alias)?;
        session.abort_attempt();
        let _op = session.lock_ops().await;

        if !session.state().is_down() {
            if let Some(transport) = session.mark_disconnected()? {
                close_transport(alias, transport).await;
            }
        }

        tracing::info!(%alias, "Reconnecting");
        self.establish(&session).await
    }

    /// Disconnect and forget a session, dropping its rules
    pub async fn remove(&self, alias: &SessionAlias) -> Result<(), GotsshError> {
        let session = self.registry.get(alias)?;
        self.shut_down(&session).await?;
        session.lifetime().cancel();
        self.registry.remove_entry(&session);
        tracing::info!(%alias, "Session removed");
        Ok(())
    }

    pub fn status(&self, alias: &SessionAlias) -> Result<SessionStatus, SessionError> {
        Ok(self.registry.get(alias)?.status())
    }

    /// Status of every session, ordered by alias
    pub fn status_all(&self) -> Vec<SessionStatus> {
        self.registry.list().iter().map(|s| s.status()).collect()
    }

    /// Disconnect every session and stop all background tasks
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sessions = self.registry.list();
        let results = join_all(sessions.iter().map(|s| self.shut_down(s))).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(alias = %session.alias(), "Shutdown of session failed: {}", e);
            }
        }
        tracing::info!("Connection manager shut down ({} sessions)", sessions.len());
    }

    /// Connect with retries, then restore forwards and enter `Active`.
    /// The caller holds the session's operation lock.
    async fn establish(&self, session: &Session) -> Result<(), GotsshError> {
        let result = self.connect_with_retry(session).await;
        session.end_attempt();
        result
    }

    async fn connect_with_retry(&self, session: &Session) -> Result<(), GotsshError> {
        let alias = session.alias();
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);
        let mut attempt = 0;

        loop {
            attempt += 1;
            // stays armed through the backoff sleep below
            let cancel = session.begin_attempt()?;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
                outcome = self.attempt(session) => outcome,
            };

            let error = match outcome {
                Ok(transport) => {
                    session.attach(Arc::from(transport))?;
                    let restored = self.forwards.restore(session).await;
                    session.transition(SessionState::Active)?;
                    tracing::info!(%alias, attempt, restored, "Session active");
                    return Ok(());
                }
                Err(e) => e,
            };

            session.fail(error.to_string())?;
            if !error.is_retryable() || attempt >= max_attempts {
                tracing::warn!(%alias, attempt, "Connect failed: {}", error);
                return Err(error.into());
            }

            let delay = backoff.next_delay();
            tracing::warn!(%alias, attempt, "Connect failed: {}. Retrying in {:?}", error, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled.into()),
            }
        }
    }

    /// Fail an `Active` session whose transport has died. Returns whether
    /// this call did the transition.
    pub(crate) async fn handle_dead_transport(&self, session: &Session) -> bool {
        let _op = session.lock_ops().await;
        if session.state() != SessionState::Active || session.transport_alive() != Some(false) {
            return false;
        }

        let error = ConnectionError::Closed.to_string();
        match session.fail(error) {
            Ok(transport) => {
                tracing::warn!(alias = %session.alias(), "Transport lost; forwards are inactive");
                if let Some(transport) = transport {
                    close_transport(session.alias(), transport).await;
                }
                true
            }
            Err(e) => {
                tracing::warn!(alias = %session.alias(), "Failed to record transport loss: {}", e);
                false
            }
        }
    }

    async fn attempt(&self, session: &Session) -> Result<Box<dyn Transport>, ConnectionError> {
        let target = session.target();
        let pending = self.connector.handshake(target).await?;

        let limit = self.config.auth_timeout;
        timeout(limit, pending.authenticate(&target.user, session.auth()))
            .await
            .map_err(|_| ConnectionError::Timeout {
                stage: "authentication",
                after: limit,
            })?
    }
}

async fn close_transport(alias: &SessionAlias, transport: Arc<dyn Transport>) {
    if let Err(e) = transport.close().await {
        tracing::debug!(%alias, "Closing transport failed: {}", e);
    }
}
