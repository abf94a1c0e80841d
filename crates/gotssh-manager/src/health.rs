//! Per-session transport health monitoring

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use gotssh_core::SessionState;

use crate::manager::ConnectionManager;
use crate::session::Session;

/// Start polling `session`'s transport until the session is removed or the
/// manager shuts down.
pub(crate) fn spawn_monitor(manager: &Arc<ConnectionManager>, session: &Arc<Session>) {
    let interval = manager.config().health_check_interval;
    tokio::spawn(run_monitor(
        Arc::downgrade(manager),
        Arc::clone(session),
        interval,
        session.lifetime().clone(),
    ));
}

async fn run_monitor(
    manager: Weak<ConnectionManager>,
    session: Arc<Session>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(alias = %session.alias(), "Health monitor started (interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if session.state() != SessionState::Active || session.transport_alive() != Some(false) {
            continue;
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if !manager.handle_dead_transport(&session).await {
            continue;
        }

        if manager.config().auto_reconnect {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = manager.reconnect(session.alias()) => match result {
                    Ok(()) => tracing::info!(alias = %session.alias(), "Reconnected after transport loss"),
                    Err(e) => tracing::warn!(alias = %session.alias(), "Automatic reconnect failed: {}", e),
                },
            }
        }
    }
    tracing::debug!(alias = %session.alias(), "Health monitor stopped");
}
