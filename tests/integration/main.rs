//! Mesh-Pulse integration test harness.
//!
//! Every test runs whole nodes in-process on loopback: a real TCP transfer
//! listener, a real UDP beacon socket, and a private receive directory.
//!
//!   cargo test --test integration
//!
//! Nodes are torn down when their `TestNode` is dropped.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use meshpulse_core::crypto::SharedKey;
use meshpulse_services::{
    Discovery, DiscoverySettings, Event, EventBus, LocalIdentity, PeerRegistry, TransferEngine,
    TransferSettings, TransferSnapshot,
};

mod discovery;
mod failures;
mod transfers;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(20);

pub struct TestNode {
    pub engine: TransferEngine,
    pub registry: PeerRegistry,
    /// Transfer listener address.
    pub addr: SocketAddr,
    pub dir: TempDir,
    shutdown: broadcast::Sender<()>,
}

impl TestNode {
    pub async fn start(secret: &str) -> Self {
        Self::start_with(secret, |_| {}).await
    }

    /// Start a node whose transfer settings are adjusted by `tweak`.
    pub async fn start_with(secret: &str, tweak: impl FnOnce(&mut TransferSettings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = TransferSettings {
            receive_dir: dir.path().join("received"),
            progress_interval: Duration::ZERO,
            ..TransferSettings::default()
        };
        tweak(&mut settings);

        let events = EventBus::new();
        let registry = PeerRegistry::new(events.clone());
        let engine = TransferEngine::new(
            SharedKey::derive(secret).unwrap(),
            settings,
            registry.clone(),
            events,
        );
        let listener = TransferEngine::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown, _) = broadcast::channel(1);
        {
            let engine = engine.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { engine.serve(listener, rx).await });
        }

        Self {
            engine,
            registry,
            addr,
            dir,
            shutdown,
        }
    }

    pub fn receive_dir(&self) -> PathBuf {
        self.dir.path().join("received")
    }

    /// Names of the files currently in the receive directory.
    pub fn received(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.receive_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Bind beacon sockets for this node, announcing to `announce_to`.
    pub fn discovery(&self, name: &str, announce_to: SocketAddr) -> Arc<Discovery> {
        let settings = DiscoverySettings {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            announce_to,
            announce_interval: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(50),
            stale_after: Duration::from_millis(300),
            ttl: Duration::from_millis(600),
        };
        let identity = LocalIdentity::generate(name, self.addr.port());
        Arc::new(Discovery::bind(settings, identity, self.registry.clone()).unwrap())
    }

    /// Subscribe a fresh receiver to this node's shutdown signal.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Deterministic, non-repeating-per-chunk test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_right(13) as u8).collect()
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// First terminal transfer event on `rx`, whatever its session.
pub async fn next_terminal(rx: &mut broadcast::Receiver<Event>) -> TransferSnapshot {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(s) = event.terminal() {
                        return s.clone();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a terminal event")
}

/// Terminal event for one session.
pub async fn terminal_of(
    rx: &mut broadcast::Receiver<Event>,
    id: meshpulse_services::SessionId,
) -> TransferSnapshot {
    tokio::time::timeout(WAIT, meshpulse_services::wait_for_terminal(rx, id))
        .await
        .expect("timed out waiting for session to finish")
        .expect("event bus closed")
}

/// Poll `cond` until it holds or `WAIT` passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
