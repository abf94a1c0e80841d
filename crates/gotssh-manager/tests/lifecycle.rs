mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use gotssh_core::{
    AuthMethod, ConnectionError, GotsshError, SessionAlias, SessionError, SessionState,
};

use gotssh_core::config::{BackoffConfig, ManagerConfig};

use common::{eventually, fast_config, state, state_with, target, Step};

#[tokio::test]
async fn test_connect_registers_active_session() {
    let (state, script) = state();
    let manager = state.connections();

    let session = manager
        .connect("box", target(), AuthMethod::key("/home/me/.ssh/id_ed25519"))
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::Active);
    assert!(session.last_error().is_none());
    let found = state.registry().lookup(&"box".into()).unwrap();
    assert!(Arc::ptr_eq(&found, &session));
    assert_eq!(script.handshakes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_duplicate_alias() {
    let (state, _) = state();
    let manager = state.connections();

    let first = manager.connect("prod", target(), AuthMethod::Agent).await.unwrap();
    let err = manager
        .connect("prod", target(), AuthMethod::Agent)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GotsshError::Session(SessionError::DuplicateAlias(_))
    ));
    let still = state.registry().lookup(&"prod".into()).unwrap();
    assert!(Arc::ptr_eq(&still, &first));
    assert_eq!(still.state(), SessionState::Active);
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let (state, script) = state();
    script.push([Step::AuthRejected]);

    let err = state
        .connections()
        .connect("box", target(), AuthMethod::password("hunter2"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GotsshError::Connection(ConnectionError::Auth(_))
    ));
    assert_eq!(script.auths.load(Ordering::SeqCst), 1);
    assert_eq!(script.handshakes.load(Ordering::SeqCst), 1);
    // a failed connect leaves nothing behind
    assert!(state.registry().lookup(&"box".into()).is_none());
}

#[tokio::test]
async fn test_host_key_failure_is_not_retried() {
    let (state, script) = state();
    script.push([Step::HostKeyRejected, Step::Succeed]);

    let err = state
        .connections()
        .connect("box", target(), AuthMethod::Auto)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GotsshError::Connection(ConnectionError::HostKeyRejected(_))
    ));
    assert_eq!(script.handshakes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_network_failures_use_every_attempt() {
    let (state, script) = state();
    script.push([Step::NetworkError, Step::NetworkError, Step::NetworkError, Step::Succeed]);

    let err = state
        .connections()
        .connect("box", target(), AuthMethod::Agent)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GotsshError::Connection(ConnectionError::Network(_))
    ));
    assert_eq!(
        script.handshakes.load(Ordering::SeqCst),
        fast_config().max_attempts as usize
    );
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let (state, script) = state();
    script.push([Step::NetworkError, Step::Succeed]);

    let session = state
        .connections()
        .connect("box", target(), AuthMethod::Agent)
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::Active);
    assert!(session.last_error().is_none());
    assert_eq!(script.handshakes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_auth_timeout_is_retried() {
    let (state, script) = state_with(gotssh_core::config::ManagerConfig {
        max_attempts: 2,
        ..fast_config()
    });
    script.push([Step::HangAuth, Step::HangAuth]);

    let err = state
        .connections()
        .connect("box", target(), AuthMethod::Agent)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GotsshError::Connection(ConnectionError::Timeout {
            stage: "authentication",
            ..
        })
    ));
    assert_eq!(script.auths.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disconnect_keeps_session_registered() {
    let (state, script) = state();
    let manager = state.connections();
    manager.connect("box", target(), AuthMethod::Agent).await.unwrap();

    manager.disconnect(&"box".into()).await.unwrap();

    let status = manager.status(&"box".into()).unwrap();
    assert_eq!(status.state, SessionState::Disconnected);
    assert!(status.last_error.is_none());
    // the transport was closed
    let alive = script.current.lock().as_ref().unwrap().load(Ordering::SeqCst);
    assert!(!alive);

    // disconnecting twice is harmless
    manager.disconnect(&"box".into()).await.unwrap();
}

#[tokio::test]
async fn test_unknown_alias() {
    let (state, _) = state();
    let manager = state.connections();
    let alias = SessionAlias::new("ghost");

    for err in [
        manager.disconnect(&alias).await.unwrap_err(),
        manager.reconnect(&alias).await.unwrap_err(),
        manager.remove(&alias).await.unwrap_err(),
    ] {
        assert!(matches!(err, GotsshError::Session(SessionError::NotFound(_))));
    }
    assert!(matches!(
        manager.status(&alias),
        Err(SessionError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let (state, script) = state();
    let manager = state.connections();
    manager.connect("box", target(), AuthMethod::Agent).await.unwrap();
    manager.disconnect(&"box".into()).await.unwrap();

    manager.reconnect(&"box".into()).await.unwrap();

    assert_eq!(
        manager.status(&"box".into()).unwrap().state,
        SessionState::Active
    );
    assert_eq!(script.handshakes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_reconnect_records_error() {
    let (state, script) = state();
    let manager = state.connections();
    manager.connect("box", target(), AuthMethod::Agent).await.unwrap();
    manager.disconnect(&"box".into()).await.unwrap();

    script.push([Step::AuthRejected]);
    assert!(manager.reconnect(&"box".into()).await.is_err());

    let status = manager.status(&"box".into()).unwrap();
    assert_eq!(status.state, SessionState::Failed);
    assert!(status.last_error.unwrap().contains("denied"));
}

#[tokio::test]
async fn test_remove_then_alias_is_free() {
    let (state, _) = state();
    let manager = state.connections();
    manager.connect("box", target(), AuthMethod::Agent).await.unwrap();

    manager.remove(&"box".into()).await.unwrap();
    assert!(state.registry().is_empty());

    manager.connect("box", target(), AuthMethod::Agent).await.unwrap();
    assert_eq!(state.registry().len(), 1);
}

#[tokio::test]
async fn test_health_monitor_reconnects_dead_transport() {
    let (state, script) = state();
    let manager = state.connections();
    let session = manager.connect("box", target(), AuthMethod::Agent).await.unwrap();

    script.kill_current();

    assert!(
        common::eventually(|| script.handshakes.load(Ordering::SeqCst) == 2
            && session.state() == SessionState::Active)
        .await
    );
}

#[tokio::test]
async fn test_dead_transport_without_auto_reconnect() {
    let (state, script) = state_with(gotssh_core::config::ManagerConfig {
        auto_reconnect: false,
        ..fast_config()
    });
    let session = state
        .connections()
        .connect("box", target(), AuthMethod::Agent)
        .await
        .unwrap();

    script.kill_current();

    assert!(common::eventually(|| session.state() == SessionState::Failed).await);
    assert_eq!(
        session.last_error().as_deref(),
        Some(ConnectionError::Closed.to_string().as_str())
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(script.handshakes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_status_all_and_shutdown() {
    let (state, _) = state();
    let manager = state.connections();
    for alias in ["web", "api", "db"] {
        manager.connect(alias, target(), AuthMethod::Agent).await.unwrap();
    }

    let aliases: Vec<_> = manager
        .status_all()
        .into_iter()
        .map(|s| s.alias.to_string())
        .collect();
    assert_eq!(aliases, ["api", "db", "web"]);

    let sessions = state.registry().list();
    state.shutdown().await;

    assert!(state.registry().is_empty());
    assert!(sessions
        .iter()
        .all(|s| s.state() == SessionState::Disconnected));
}

#[tokio::test]
async fn test_disconnect_aborts_inflight_connect() {
    let (state, script) = state_with(ManagerConfig {
        auth_timeout: Duration::from_secs(60),
        ..fast_config()
    });
    script.push([Step::HangAuth]);
    let manager = Arc::clone(state.connections());

    let connecting = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.connect("box", target(), AuthMethod::Agent).await }
    });
    assert!(eventually(|| script.auths.load(Ordering::SeqCst) == 1).await);

    tokio::time::timeout(Duration::from_secs(5), manager.disconnect(&"box".into()))
        .await
        .expect("disconnect waited on the hung attempt")
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), connecting)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, GotsshError::Connection(ConnectionError::Cancelled)));
    assert!(state.registry().is_empty());
}

#[tokio::test]
async fn test_disconnect_aborts_backoff() {
    let (state, script) = state_with(ManagerConfig {
        backoff: BackoffConfig {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..fast_config()
    });
    script.push([Step::NetworkError]);
    let manager = Arc::clone(state.connections());

    let connecting = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.connect("box", target(), AuthMethod::Agent).await }
    });
    let alias: SessionAlias = "box".into();
    assert!(
        eventually(|| state
            .registry()
            .lookup(&alias)
            .is_some_and(|s| s.state() == SessionState::Failed))
        .await
    );

    manager.disconnect(&alias).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), connecting)
        .await
        .expect("backoff sleep was not interrupted")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, GotsshError::Connection(ConnectionError::Cancelled)));
    assert_eq!(script.handshakes.load(Ordering::SeqCst), 1);
    assert!(state.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_racing_connect_never_leaves_session_active() {
    let (state, _) = state();
    let manager = Arc::clone(state.connections());

    for i in 0..20 {
        let alias = SessionAlias::new(format!("race-{}", i));
        let connecting = tokio::spawn({
            let manager = Arc::clone(&manager);
            let alias = alias.clone();
            async move { manager.connect(alias, target(), AuthMethod::Agent).await }
        });
        while state.registry().lookup(&alias).is_none() {
            tokio::task::yield_now().await;
        }

        manager.disconnect(&alias).await.unwrap();

        match connecting.await.unwrap() {
            Ok(session) => assert_eq!(session.state(), SessionState::Disconnected),
            Err(e) => {
                assert!(matches!(e, GotsshError::Connection(ConnectionError::Cancelled)));
                assert!(state.registry().lookup(&alias).is_none());
            }
        }
    }
}
