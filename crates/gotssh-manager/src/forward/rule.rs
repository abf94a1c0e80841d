//! Forward rules and their per-session bookkeeping

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use gotssh_core::{Endpoint, ForwardDirection, ForwardSpec, RuleId, SessionAlias};

/// A forward registered on a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardRule {
    pub id: RuleId,
    /// Owning session
    pub session: SessionAlias,
    pub spec: ForwardSpec,
    /// Whether the listener is currently running
    pub active: bool,
    /// Endpoint actually bound while active; resolves a requested port 0
    pub bound: Option<Endpoint>,
    pub last_error: Option<String>,
}

impl ForwardRule {
    pub fn direction(&self) -> ForwardDirection {
        self.spec.direction()
    }
}

/// How long removing a rule waits for its listener to be released
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Stop signal and accept loop of a running relay
pub(crate) struct RelayHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub(crate) fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Signal the relay to stop without waiting for it
    pub(crate) fn cancel(self) {
        self.cancel.cancel();
    }
}

/// A rule plus the handle of its running relay
pub(crate) struct RuleSlot {
    pub(crate) rule: ForwardRule,
    relay: Option<RelayHandle>,
}

impl RuleSlot {
    pub(crate) fn active(rule: ForwardRule, relay: RelayHandle) -> Self {
        Self {
            rule,
            relay: Some(relay),
        }
    }

    pub(crate) fn activate(&mut self, bound: Endpoint, relay: RelayHandle) {
        self.signal_stop();
        self.rule.active = true;
        self.rule.bound = Some(bound);
        self.rule.last_error = None;
        self.relay = Some(relay);
    }

    /// Stop the relay and mark the rule inactive
    pub(crate) fn deactivate(&mut self) {
        self.signal_stop();
        self.rule.active = false;
        self.rule.bound = None;
    }

    /// Record a failed re-bind; the rule stays inactive
    pub(crate) fn fail(&mut self, error: String) {
        self.deactivate();
        self.rule.last_error = Some(error);
    }

    /// Stop the relay and wait until its listener is released
    pub(crate) async fn stop(mut self) {
        let Some(relay) = self.relay.take() else {
            return;
        };
        relay.cancel.cancel();
        match timeout(STOP_GRACE, relay.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(rule = %self.rule.id, "Relay task ended abnormally: {}", e),
            Err(_) => tracing::warn!(rule = %self.rule.id, "Relay did not stop within {:?}", STOP_GRACE),
        }
    }

    /// Cancel without waiting; the accept loop winds down on its own
    fn signal_stop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.cancel();
        }
    }
}

impl Drop for RuleSlot {
    fn drop(&mut self) {
        self.signal_stop();
    }
}
