//! Port-forward engine
//!
//! Rules live on their [`Session`]; the engine starts and stops the relays
//! behind them. Every relay rides the session's one transport and runs as
//! its own task, so control operations never wait on forwarded traffic.

mod dynamic;
mod local;
pub(crate) mod relay;
mod remote;
mod rule;

use std::sync::Arc;

use gotssh_core::{ForwardError, ForwardSpec, GotsshError, RuleId, SessionAlias};

use crate::registry::SessionRegistry;
use crate::session::Session;
use relay::{relay_for, Started};

pub use rule::ForwardRule;
pub(crate) use rule::{RelayHandle, RuleSlot};

/// Adds, removes and lists forward rules on registered sessions
pub struct ForwardEngine {
    registry: Arc<SessionRegistry>,
}

impl ForwardEngine {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Start forwarding `spec` over the session's transport.
    ///
    /// The session must be `Authenticated` or `Active`. Failures leave the
    /// session untouched and create no rule.
    pub async fn add_forward(
        &self,
        alias: &SessionAlias,
        spec: ForwardSpec,
    ) -> Result<ForwardRule, GotsshError> {
        let session = self.registry.get(alias)?;
        let _op = session.lock_ops().await;

        let not_active = || ForwardError::SessionNotActive {
            alias: alias.clone(),
            state: session.state(),
        };
        if !session.state().accepts_forwards() {
            return Err(not_active().into());
        }
        let (link, generation) = session.link().ok_or_else(not_active)?;

        let id = session.allocate_rule_id();
        let cancel = generation.child_token();
        let started = match relay_for(&spec).start(link, cancel.clone()).await {
            Ok(started) => started,
            Err(e) => {
                cancel.cancel();
                tracing::warn!(%alias, %spec, "Forward setup failed: {}", e);
                return Err(e.into());
            }
        };

        let rule = ForwardRule {
            id,
            session: alias.clone(),
            spec,
            active: true,
            bound: Some(started.bound),
            last_error: None,
        };
        session.insert_rule(RuleSlot::active(
            rule.clone(),
            RelayHandle::new(cancel, started.task),
        ));
        tracing::info!(%alias, rule = %id, spec = %rule.spec, "Forward added");
        Ok(rule)
    }

    /// Stop and delete a rule.
    ///
    /// Returns once the rule's listener is released, so its bind address can
    /// be reused immediately.
    pub async fn remove_forward(&self, alias: &SessionAlias, id: RuleId) -> Result<(), GotsshError> {
        let session = self.registry.get(alias)?;
        let _op = session.lock_ops().await;

        match session.take_rule(id) {
            Some(slot) => {
                let spec = slot.rule.spec.clone();
                slot.stop().await;
                tracing::info!(%alias, rule = %id, %spec, "Forward removed");
                Ok(())
            }
            None => Err(ForwardError::RuleNotFound {
                alias: alias.clone(),
                rule: id,
            }
            .into()),
        }
    }

    /// Rules of a session, active or not, ordered by id
    pub fn list_forwards(&self, alias: &SessionAlias) -> Result<Vec<ForwardRule>, GotsshError> {
        Ok(self.registry.get(alias)?.forwards())
    }

    /// Re-bind every inactive rule over the session's current transport.
    ///
    /// Rules that fail stay inactive with the error recorded. The caller holds
    /// the session's operation lock. Returns how many rules were restored.
    pub(crate) async fn restore(&self, session: &Session) -> usize {
        let Some((link, generation)) = session.link() else {
            return 0;
        };

        let mut restored = 0;
        for (id, spec) in session.inactive_rules() {
            let cancel = generation.child_token();
            match relay_for(&spec).start(link.clone(), cancel.clone()).await {
                Ok(Started { bound, task }) => {
                    tracing::info!(alias = %session.alias(), rule = %id, %bound, "Forward restored");
                    session.activate_rule(id, bound, RelayHandle::new(cancel, task));
                    restored += 1;
                }
                Err(e) => {
                    cancel.cancel();
                    tracing::warn!(alias = %session.alias(), rule = %id, "Forward could not be restored: {}", e);
                    session.rule_failed(id, e.to_string());
                }
            }
        }
        restored
    }
}
