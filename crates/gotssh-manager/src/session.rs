//! A named SSH session: target, credentials, lifecycle state and forward rules
//!
//! All mutable fields live behind one short-lived `parking_lot` mutex that is
//! never held across an await. Multi-step operations (connect, disconnect,
//! forward add/remove) serialize on the separate async operation lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use gotssh_core::{
    AuthMethod, Endpoint, ForwardSpec, RuleId, SessionAlias, SessionError, SessionState,
    SessionTarget,
};
use gotssh_tunnel::Transport;

use crate::forward::relay::TransportLink;
use crate::forward::{ForwardRule, RelayHandle, RuleSlot};

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub alias: SessionAlias,
    pub target: SessionTarget,
    pub auth: &'static str,
    pub state: SessionState,
    pub last_error: Option<String>,
    pub forwards: Vec<ForwardRule>,
}

struct SessionInner {
    state: SessionState,
    last_error: Option<String>,
    /// The only strong reference to the transport
    transport: Option<Arc<dyn Transport>>,
    /// Cancelled whenever the current transport is torn down
    generation: CancellationToken,
    /// Set while a connect attempt is in flight
    attempt: Option<CancellationToken>,
    rules: BTreeMap<RuleId, RuleSlot>,
}

pub struct Session {
    alias: SessionAlias,
    target: SessionTarget,
    auth: AuthMethod,
    inner: Mutex<SessionInner>,
    ops: AsyncMutex<()>,
    next_rule_id: AtomicU64,
    /// Cancelled when the session is removed or the manager shuts down
    lifetime: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        alias: SessionAlias,
        target: SessionTarget,
        auth: AuthMethod,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            alias,
            target,
            auth,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                last_error: None,
                transport: None,
                generation: CancellationToken::new(),
                attempt: None,
                rules: BTreeMap::new(),
            }),
            ops: AsyncMutex::new(()),
            next_rule_id: AtomicU64::new(1),
            lifetime,
        }
    }

    pub fn alias(&self) -> &SessionAlias {
        &self.alias
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub(crate) fn auth(&self) -> &AuthMethod {
        &self.auth
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock();
        SessionStatus {
            alias: self.alias.clone(),
            target: self.target.clone(),
            auth: self.auth.kind(),
            state: inner.state,
            last_error: inner.last_error.clone(),
            forwards: inner.rules.values().map(|slot| slot.rule.clone()).collect(),
        }
    }

    /// Snapshot of the forward rules, ordered by id
    pub fn forwards(&self) -> Vec<ForwardRule> {
        self.inner
            .lock()
            .rules
            .values()
            .map(|slot| slot.rule.clone())
            .collect()
    }

    pub(crate) async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    pub(crate) fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub(crate) fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        Self::apply(&self.alias, &mut inner, next)
    }

    fn apply(
        alias: &SessionAlias,
        inner: &mut SessionInner,
        next: SessionState,
    ) -> Result<(), SessionError> {
        let from = inner.state;
        inner.state = from.transition(next)?;
        tracing::debug!(%alias, %from, to = %next, "Session state changed");
        Ok(())
    }

    /// Enter `Connecting` and return the token that aborts this attempt.
    pub(crate) fn begin_attempt(&self) -> Result<CancellationToken, SessionError> {
        let mut inner = self.inner.lock();
        Self::apply(&self.alias, &mut inner, SessionState::Connecting)?;
        let token = CancellationToken::new();
        inner.attempt = Some(token.clone());
        Ok(token)
    }

    pub(crate) fn end_attempt(&self) {
        self.inner.lock().attempt = None;
    }

    /// Abort an in-flight connect attempt, if any. Does not wait for the
    /// operation lock.
    pub(crate) fn abort_attempt(&self) {
        if let Some(token) = &self.inner.lock().attempt {
            token.cancel();
        }
    }

    /// Install a freshly authenticated transport and enter `Authenticated`.
    pub(crate) fn attach(&self, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        Self::apply(&self.alias, &mut inner, SessionState::Authenticated)?;
        inner.transport = Some(transport);
        inner.generation = CancellationToken::new();
        inner.last_error = None;
        Ok(())
    }

    /// Weak transport handle plus the current generation token
    pub(crate) fn link(&self) -> Option<(TransportLink, CancellationToken)> {
        let inner = self.inner.lock();
        let transport = inner.transport.as_ref()?;
        Some((Arc::downgrade(transport), inner.generation.clone()))
    }

    pub(crate) fn transport_alive(&self) -> Option<bool> {
        self.inner.lock().transport.as_ref().map(|t| t.is_alive())
    }

    /// Enter `Failed` with `error` recorded, tearing the transport down.
    ///
    /// The detached transport is returned so the caller can close it
    /// outside the lock.
    pub(crate) fn fail(&self, error: String) -> Result<Option<Arc<dyn Transport>>, SessionError> {
        let mut inner = self.inner.lock();
        Self::apply(&self.alias, &mut inner, SessionState::Failed)?;
        inner.last_error = Some(error);
        Ok(Self::teardown(&mut inner))
    }

    /// Enter `Disconnected`, tearing the transport down. Already
    /// disconnected sessions are left alone.
    pub(crate) fn mark_disconnected(&self) -> Result<Option<Arc<dyn Transport>>, SessionError> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Disconnected {
            return Ok(None);
        }
        Self::apply(&self.alias, &mut inner, SessionState::Disconnected)?;
        Ok(Self::teardown(&mut inner))
    }

    fn teardown(inner: &mut SessionInner) -> Option<Arc<dyn Transport>> {
        inner.generation.cancel();
        for slot in inner.rules.values_mut() {
            slot.deactivate();
        }
        inner.transport.take()
    }

    pub(crate) fn allocate_rule_id(&self) -> RuleId {
        RuleId(self.next_rule_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn insert_rule(&self, slot: RuleSlot) {
        self.inner.lock().rules.insert(slot.rule.id, slot);
    }

    pub(crate) fn take_rule(&self, id: RuleId) -> Option<RuleSlot> {
        self.inner.lock().rules.remove(&id)
    }

    pub(crate) fn inactive_rules(&self) -> Vec<(RuleId, ForwardSpec)> {
        self.inner
            .lock()
            .rules
            .values()
            .filter(|slot| !slot.rule.active)
            .map(|slot| (slot.rule.id, slot.rule.spec.clone()))
            .collect()
    }

    pub(crate) fn activate_rule(&self, id: RuleId, bound: Endpoint, relay: RelayHandle) {
        if let Some(slot) = self.inner.lock().rules.get_mut(&id) {
            slot.activate(bound, relay);
            return;
        }
        relay.cancel();
    }

    pub(crate) fn rule_failed(&self, id: RuleId, error: String) {
        if let Some(slot) = self.inner.lock().rules.get_mut(&id) {
            slot.fail(error);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("alias", &self.alias)
            .field("target", &self.target)
            .field("auth", &self.auth)
            .field("state", &self.state())
            .finish()
    }
}
