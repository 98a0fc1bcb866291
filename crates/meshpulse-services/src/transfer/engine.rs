//! The transfer engine: accepts and initiates TCP transfers.
//!
//! Each transfer runs in its own task, sequentially chunk by chunk. The
//! engine handle itself only creates sessions, spawns handlers, and answers
//! queries, so it can be cloned freely into the accept loop, the daemon,
//! and tests.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use meshpulse_core::config::TransferConfig;
use meshpulse_core::crypto::SharedKey;
use meshpulse_core::wire::{sanitize_file_name, MAX_MESSAGE_LEN};

use crate::events::{Event, EventBus};
use crate::peer::PeerRegistry;

use super::error::TransferError;
use super::frame::deadline;
use super::receiver;
use super::sender::{self, Outgoing};
use super::session::{
    cancel_requested, Direction, Flow, SessionHandle, SessionId, SessionTable, TransferSnapshot,
    TransferState,
};

/// Back-off after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Engine-wide transfer policy, resolved from configuration.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub receive_dir: PathBuf,
    pub accept_incoming: bool,
    pub handshake_timeout: Duration,
    pub stall_timeout: Duration,
    pub max_file_bytes: u64,
    pub progress_interval: Duration,
    pub session_grace: Duration,
}

impl TransferSettings {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            receive_dir: config.receive_dir.clone(),
            accept_incoming: config.accept_incoming,
            handshake_timeout: config.handshake_timeout(),
            stall_timeout: config.stall_timeout(),
            max_file_bytes: config.max_file_bytes,
            progress_interval: config.progress_interval(),
            session_grace: config.session_grace(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

struct Inner {
    key: SharedKey,
    settings: TransferSettings,
    registry: PeerRegistry,
    sessions: SessionTable,
    events: EventBus,
}

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl TransferEngine {
    pub fn new(
        key: SharedKey,
        settings: TransferSettings,
        registry: PeerRegistry,
        events: EventBus,
    ) -> Self {
        let sessions = SessionTable::new(
            events.clone(),
            settings.progress_interval,
            settings.session_grace,
        );
        Self {
            inner: Arc::new(Inner {
                key,
                settings,
                registry,
                sessions,
                events,
            }),
        }
    }

    /// Bind the transfer listener. Failure is fatal to startup.
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind transfer listener on {addr}"))
    }

    /// Accept inbound transfers until shutdown. In-flight transfers keep
    /// running in their own tasks.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let local = listener.local_addr().context("listener has no local address")?;
        tracing::info!(addr = %local, "transfer listener starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("transfer listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tracing::debug!(peer = %remote, "inbound transfer connection");
                        let engine = self.clone();
                        tokio::spawn(async move { engine.run_receive(stream, remote).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    /// Send a file to a peer found in the registry by id or display name.
    ///
    /// An unknown peer fails immediately and creates no session.
    pub fn send(&self, peer_query: &str, path: impl AsRef<Path>) -> Result<SessionId, TransferError> {
        self.send_with_message(peer_query, path, None)
    }

    /// `send` with a short note carried in the header.
    pub fn send_with_message(
        &self,
        peer_query: &str,
        path: impl AsRef<Path>,
        message: Option<String>,
    ) -> Result<SessionId, TransferError> {
        let peer = self
            .inner
            .registry
            .resolve(peer_query)
            .ok_or_else(|| TransferError::UnknownPeer(peer_query.to_string()))?;
        self.start_send(peer.addr, &peer.id, path.as_ref(), message)
    }

    /// Send a file to an explicit address, bypassing the registry.
    pub fn send_to(
        &self,
        addr: SocketAddr,
        label: &str,
        path: impl AsRef<Path>,
    ) -> Result<SessionId, TransferError> {
        self.start_send(addr, label, path.as_ref(), None)
    }

    /// Request cancellation of a live session.
    ///
    /// A session still in INIT, including one blocked in connect, ends
    /// CANCELLED without waiting for the connect timeout. Returns false for
    /// unknown or finished sessions.
    pub fn cancel(&self, id: SessionId) -> bool {
        let accepted = self.inner.sessions.cancel(id);
        if accepted {
            tracing::info!(session = %id, "cancellation requested");
        }
        accepted
    }

    pub fn session(&self, id: SessionId) -> Option<TransferSnapshot> {
        self.inner.sessions.get(id)
    }

    pub fn sessions(&self) -> Vec<TransferSnapshot> {
        self.inner.sessions.list()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    fn start_send(
        &self,
        addr: SocketAddr,
        label: &str,
        path: &Path,
        message: Option<String>,
    ) -> Result<SessionId, TransferError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| sanitize_file_name(n).ok())
            .ok_or_else(|| {
                TransferError::file(
                    path,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "no usable file name"),
                )
            })?;
        if message.as_ref().is_some_and(|m| m.len() > MAX_MESSAGE_LEN) {
            return Err(TransferError::Protocol(format!(
                "message longer than {MAX_MESSAGE_LEN} bytes"
            )));
        }

        let handle = self
            .inner
            .sessions
            .open(Direction::Send, label.to_string(), addr, file_name);
        let id = handle.id();
        tracing::info!(session = %id, peer = %label, %addr, path = %path.display(), "send requested");

        let engine = self.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move { engine.run_send(handle, addr, path, message).await });
        Ok(id)
    }

    async fn run_send(
        self,
        mut handle: SessionHandle,
        addr: SocketAddr,
        path: PathBuf,
        message: Option<String>,
    ) {
        let result = self.drive_send(&mut handle, addr, &path, message).await;
        settle(handle, result);
    }

    async fn drive_send(
        &self,
        handle: &mut SessionHandle,
        addr: SocketAddr,
        path: &Path,
        message: Option<String>,
    ) -> Result<Flow, TransferError> {
        let settings = &self.inner.settings;

        let mut file = File::open(path)
            .await
            .map_err(|e| TransferError::file(path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| TransferError::file(path, e))?
            .len();
        let file_name = handle.snapshot().file_name.clone();
        handle.describe(&file_name, size, message.clone());

        let cancel = handle.cancel_signal();
        let connect = deadline(settings.handshake_timeout, "connect", async {
            TcpStream::connect(addr)
                .await
                .map_err(TransferError::Connection)
        });
        let mut stream = tokio::select! {
            biased;
            r = connect => r?,
            _ = cancel_requested(cancel.clone()) => {
                // CANCELLED is only reachable from a started session.
                handle.transition(TransferState::Handshaking);
                return Ok(Flow::Cancelled);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "TCP_NODELAY not set");
        }

        handle.transition(TransferState::Handshaking);
        let outgoing = Outgoing {
            path,
            file_name,
            size,
            message,
        };
        sender::send_file(
            &mut stream,
            &mut file,
            outgoing,
            &self.inner.key,
            settings,
            handle,
            cancel,
        )
        .await
    }

    async fn run_receive(self, mut stream: TcpStream, remote: SocketAddr) {
        let peer = self
            .inner
            .registry
            .find_by_ip(remote.ip())
            .map(|p| p.id)
            .unwrap_or_else(|| remote.to_string());
        let mut handle = self
            .inner
            .sessions
            .open(Direction::Receive, peer, remote, String::new());
        handle.transition(TransferState::Handshaking);

        let cancel = handle.cancel_signal();
        // A verdict already on its way wins over a late cancel.
        let result = tokio::select! {
            biased;
            r = receiver::receive_file(&mut stream, &self.inner.key, &self.inner.settings, &mut handle) => {
                r.map(|path| Flow::Done(Some(path)))
            }
            _ = cancel_requested(cancel) => Ok(Flow::Cancelled),
        };
        drop(stream);
        settle(handle, result);
    }
}

/// Drive a finished handler's session into its terminal state.
fn settle(handle: SessionHandle, result: Result<Flow, TransferError>) {
    match result {
        Ok(Flow::Done(saved)) => {
            if let Some(path) = saved {
                tracing::info!(session = %handle.id(), path = %path.display(), "file saved");
            }
            handle.complete();
        }
        Ok(Flow::Cancelled) => {
            handle.cancelled();
        }
        Err(e) => {
            handle.fail(&e);
        }
    }
}
