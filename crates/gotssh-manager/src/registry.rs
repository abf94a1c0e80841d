//! Session registry implementation

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use gotssh_core::{SessionAlias, SessionError};

use crate::session::Session;

/// Directory of sessions by alias
pub struct SessionRegistry {
    sessions: DashMap<SessionAlias, Arc<Session>>,
}

impl SessionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a session under its alias.
    ///
    /// Fails with [`SessionError::DuplicateAlias`] if the alias is taken; the
    /// existing entry is left untouched.
    pub fn register(&self, session: Arc<Session>) -> Result<(), SessionError> {
        match self.sessions.entry(session.alias().clone()) {
            Entry::Occupied(entry) => Err(SessionError::DuplicateAlias(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(alias = %session.alias(), "Session registered");
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Get a session by alias
    pub fn lookup(&self, alias: &SessionAlias) -> Option<Arc<Session>> {
        self.sessions.get(alias).map(|r| Arc::clone(&r))
    }

    /// Like [`lookup`](Self::lookup), failing with [`SessionError::NotFound`]
    pub fn get(&self, alias: &SessionAlias) -> Result<Arc<Session>, SessionError> {
        self.lookup(alias)
            .ok_or_else(|| SessionError::NotFound(alias.clone()))
    }

    /// Remove and return a session
    pub fn remove(&self, alias: &SessionAlias) -> Option<Arc<Session>> {
        self.sessions.remove(alias).map(|(_, session)| session)
    }

    /// Remove `session` only if it is still the registered entry for its alias
    pub(crate) fn remove_entry(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.alias(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Snapshot of all sessions, ordered by alias
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(&r)).collect();
        sessions.sort_by(|a, b| a.alias().cmp(b.alias()));
        sessions
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every entry, returning what was registered
    pub(crate) fn drain(&self) -> Vec<Arc<Session>> {
        let sessions = self.list();
        for session in &sessions {
            self.remove_entry(session);
        }
        sessions
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gotssh_core::{AuthMethod, SessionTarget};
    use tokio_util::sync::CancellationToken;

    fn session(alias: &str, host: &str) -> Arc<Session> {
        Arc::new(Session::new(
            SessionAlias::new(alias),
            SessionTarget::new("root", host, 22),
            AuthMethod::Auto,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_register_then_lookup_returns_same_session() {
        let registry = SessionRegistry::new();
        for alias in ["prod", "staging", "db"] {
            let s = session(alias, "10.0.0.1");
            registry.register(Arc::clone(&s)).unwrap();
            let found = registry.lookup(&SessionAlias::new(alias)).unwrap();
            assert!(Arc::ptr_eq(&found, &s));
        }
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_duplicate_alias_keeps_original() {
        let registry = SessionRegistry::new();
        let a = session("prod", "1.1.1.1");
        let b = session("prod", "2.2.2.2");

        registry.register(Arc::clone(&a)).unwrap();
        assert!(Arc::ptr_eq(&registry.lookup(&"prod".into()).unwrap(), &a));

        let err = registry.register(b).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateAlias(alias) if alias.as_str() == "prod"));

        let still = registry.lookup(&"prod".into()).unwrap();
        assert!(Arc::ptr_eq(&still, &a));
        assert_eq!(still.target().host, "1.1.1.1");
    }

    #[test]
    fn test_get_missing() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.get(&"nope".into()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_entry_checks_identity() {
        let registry = SessionRegistry::new();
        let a = session("box", "1.1.1.1");
        let stale = session("box", "1.1.1.1");
        registry.register(Arc::clone(&a)).unwrap();

        assert!(!registry.remove_entry(&stale));
        assert!(registry.remove_entry(&a));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_is_sorted_snapshot() {
        let registry = SessionRegistry::new();
        for alias in ["web", "api", "db"] {
            registry.register(session(alias, "h")).unwrap();
        }
        let listed: Vec<_> = registry
            .list()
            .iter()
            .map(|s| s.alias().to_string())
            .collect();
        assert_eq!(listed, ["api", "db", "web"]);

        // the snapshot is unaffected by later changes
        let snapshot = registry.list();
        registry.remove(&"api".into());
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.len(), 2);
    }
}
