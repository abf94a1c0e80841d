//! Loopback connector for driving the manager without an SSH server.
//!
//! `open_direct` dials the target over plain TCP on this host, and
//! `listen_remote` binds a local listener standing in for the server side.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use gotssh_core::config::{BackoffConfig, ManagerConfig};
use gotssh_core::{AuthMethod, ConnectionError, Endpoint, SessionTarget};
use gotssh_manager::GotsshState;
use gotssh_tunnel::{
    BoxedStream, Connector, ForwardedChannel, PendingAuth, RemoteListener, Transport,
};

/// What the next connect attempt does
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    NetworkError,
    AuthRejected,
    HostKeyRejected,
    /// Never finish authenticating
    HangAuth,
}

#[derive(Default)]
pub struct Script {
    steps: Mutex<VecDeque<Step>>,
    pub handshakes: AtomicUsize,
    pub auths: AtomicUsize,
    /// Liveness flag of the most recent transport
    pub current: Mutex<Option<Arc<AtomicBool>>>,
}

impl Script {
    pub fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.steps.lock().extend(steps);
    }

    fn next(&self) -> Step {
        self.steps.lock().pop_front().unwrap_or(Step::Succeed)
    }

    /// Simulate the server dropping the current connection
    pub fn kill_current(&self) {
        if let Some(alive) = self.current.lock().as_ref() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

pub struct LoopbackConnector {
    pub script: Arc<Script>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn handshake(
        &self,
        _target: &SessionTarget,
    ) -> Result<Box<dyn PendingAuth>, ConnectionError> {
        self.script.handshakes.fetch_add(1, Ordering::SeqCst);
        match self.script.next() {
            Step::NetworkError => Err(ConnectionError::Network("connection refused".into())),
            Step::HostKeyRejected => Err(ConnectionError::HostKeyRejected("mismatch".into())),
            step => Ok(Box::new(LoopbackPending {
                step,
                script: Arc::clone(&self.script),
            })),
        }
    }
}

struct LoopbackPending {
    step: Step,
    script: Arc<Script>,
}

#[async_trait]
impl PendingAuth for LoopbackPending {
    async fn authenticate(
        self: Box<Self>,
        user: &str,
        _auth: &AuthMethod,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        self.script.auths.fetch_add(1, Ordering::SeqCst);
        match self.step {
            Step::AuthRejected => Err(ConnectionError::Auth(format!("denied for {}", user))),
            Step::HangAuth => std::future::pending().await,
            _ => {
                let alive = Arc::new(AtomicBool::new(true));
                *self.script.current.lock() = Some(Arc::clone(&alive));
                Ok(Box::new(LoopbackTransport {
                    alive,
                    remote: Mutex::new(HashMap::new()),
                }))
            }
        }
    }
}

pub struct LoopbackTransport {
    alive: Arc<AtomicBool>,
    remote: Mutex<HashMap<u16, JoinHandle<()>>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open_direct(
        &self,
        target: &Endpoint,
        _originator: &Endpoint,
    ) -> Result<BoxedStream, ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::Closed);
        }
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| ConnectionError::Refused(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn listen_remote(&self, bind: &Endpoint) -> Result<RemoteListener, ConnectionError> {
        let listener = TcpListener::bind((bind.host.as_str(), bind.port))
            .await
            .map_err(|e| ConnectionError::Refused(e.to_string()))?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let forwarded = ForwardedChannel {
                    stream: Box::new(stream),
                    originator: Endpoint::new(peer.ip().to_string(), peer.port()),
                };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
        });
        self.remote.lock().insert(port, task);

        Ok(RemoteListener {
            bound: Endpoint::new(bind.host.clone(), port),
            incoming: rx,
        })
    }

    async fn cancel_remote(&self, listener: RemoteListener) -> Result<(), ConnectionError> {
        let task = self.remote.lock().remove(&listener.bound.port);
        if let Some(task) = task {
            task.abort();
            // resolves once the listener has been dropped
            let _ = task.await;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.alive.store(false, Ordering::SeqCst);
        for (_, task) in self.remote.lock().drain() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        for (_, task) in self.remote.get_mut().drain() {
            task.abort();
        }
    }
}

pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        auth_timeout: Duration::from_millis(300),
        health_check_interval: Duration::from_millis(50),
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..Default::default()
    }
}

pub fn state_with(config: ManagerConfig) -> (GotsshState, Arc<Script>) {
    let script = Arc::new(Script::default());
    let connector = LoopbackConnector {
        script: Arc::clone(&script),
    };
    let state = GotsshState::with_connector(config, Arc::new(connector)).unwrap();
    (state, script)
}

pub fn state() -> (GotsshState, Arc<Script>) {
    state_with(fast_config())
}

pub fn target() -> SessionTarget {
    SessionTarget::new("root", "1.2.3.4", 22)
}

/// Echo server on an ephemeral localhost port
pub async fn echo_server() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    Endpoint::localhost(port)
}

/// Send `payload` through `stream` and read the echo back
pub async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

pub async fn connect_to(endpoint: &Endpoint) -> TcpStream {
    TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .unwrap()
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
