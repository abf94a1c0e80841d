//! Process-wide gotssh state

use std::sync::Arc;

use gotssh_core::config::ManagerConfig;
use gotssh_core::ConfigError;
use gotssh_tunnel::{Connector, SshConnector, SshSettings};

use crate::forward::ForwardEngine;
use crate::manager::ConnectionManager;
use crate::registry::SessionRegistry;

/// Everything a gotssh process shares: the registry and the manager that
/// drives it. Created once with [`GotsshState::new`] and torn down with
/// [`GotsshState::shutdown`].
pub struct GotsshState {
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionManager>,
}

impl GotsshState {
    /// Create state that dials real SSH servers
    pub fn new(config: ManagerConfig) -> Result<Self, ConfigError> {
        let connector = SshConnector::new(SshSettings::from_config(&config));
        Self::with_connector(config, Arc::new(connector))
    }

    /// Create state over a custom connector
    pub fn with_connector(
        config: ManagerConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(
            config,
            connector,
            Arc::clone(&registry),
        ));
        Ok(Self {
            registry,
            connections,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn forwards(&self) -> &ForwardEngine {
        self.connections.forwards()
    }

    /// Disconnect every session and empty the registry
    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
        let drained = self.registry.drain();
        tracing::debug!("Dropped {} sessions from the registry", drained.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_validates_config() {
        let config = ManagerConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            GotsshState::new(config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_with_no_sessions() {
        let state = GotsshState::new(ManagerConfig::default()).unwrap();
        assert!(state.registry().is_empty());
        state.shutdown().await;
        assert!(state.connections().status_all().is_empty());
    }
}
