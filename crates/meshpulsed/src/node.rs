//! Socket setup and background tasks for one running node.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use meshpulse_core::config::MeshConfig;
use meshpulse_core::crypto::SharedKey;
use meshpulse_services::discovery::local_hostname;
use meshpulse_services::{
    Discovery, DiscoverySettings, Event, EventBus, LocalIdentity, PeerRegistry, TransferEngine,
    TransferSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Announce, listen, and accept transfers.
    Daemon,
    /// Listen for peers only. Leaves the transfer port to a running daemon.
    SendOnly,
}

pub struct Node {
    engine: TransferEngine,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind every socket and spawn the node's tasks. Any bind failure is fatal.
    pub async fn start(config: &MeshConfig, key: SharedKey, mode: Mode) -> Result<Self> {
        let events = EventBus::new();
        let registry = PeerRegistry::new(events.clone());
        let engine = TransferEngine::new(
            key,
            TransferSettings::from_config(&config.transfer),
            registry.clone(),
            events.clone(),
        );

        let listener = match mode {
            Mode::Daemon => {
                let addr = SocketAddr::new(config.network.bind_addr, config.network.transfer_port);
                Some(TransferEngine::bind(addr).await?)
            }
            Mode::SendOnly => None,
        };
        let transfer_port = match &listener {
            Some(l) => l.local_addr().context("transfer listener has no address")?.port(),
            None => config.network.transfer_port,
        };

        let identity = LocalIdentity::generate(config.display_name(&local_hostname()), transfer_port);
        tracing::info!(
            peer_id = %identity.peer_id,
            name = %identity.name,
            transfer_port,
            "meshpulsed starting"
        );
        let discovery = Arc::new(Discovery::bind(
            DiscoverySettings::from_config(config),
            identity,
            registry,
        )?);

        // ── Shutdown channel ─────────────────────────────────────────────────
        let (shutdown, _) = broadcast::channel::<()>(1);
        let mut tasks = Vec::new();

        // ── Spawn tasks ──────────────────────────────────────────────────────

        tasks.push(tokio::spawn(log_events(events.subscribe(), shutdown.subscribe())));

        {
            let d = discovery.clone();
            let rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = d.listen_loop(rx).await {
                    tracing::error!(error = %e, "beacon listener failed");
                }
            }));
        }
        {
            let d = discovery.clone();
            let rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = d.sweep_loop(rx).await {
                    tracing::error!(error = %e, "peer sweep failed");
                }
            }));
        }

        if let Some(listener) = listener {
            {
                let d = discovery.clone();
                let rx = shutdown.subscribe();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = d.announce_loop(rx).await {
                        tracing::error!(error = %e, "announcer failed");
                    }
                }));
            }
            let e = engine.clone();
            let rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = e.serve(listener, rx).await {
                    tracing::error!(error = %err, "transfer listener failed");
                }
            }));
        }

        Ok(Self {
            engine,
            shutdown,
            tasks,
        })
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// Stop every task and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "task panicked");
            }
        }
        tracing::info!("meshpulsed stopped");
    }
}

/// Write every peer and transfer event to the log.
async fn log_events(mut events: broadcast::Receiver<Event>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn log_event(event: &Event) {
    match event {
        Event::PeerAdded(p) => {
            tracing::info!(peer = %p.id, name = %p.name, addr = %p.addr, "peer discovered")
        }
        Event::PeerUpdated(p) => {
            tracing::debug!(peer = %p.id, name = %p.name, addr = %p.addr, status = %p.status, "peer updated")
        }
        Event::PeerRemoved(p) => tracing::info!(peer = %p.id, name = %p.name, "peer expired"),
        Event::TransferStarted(s) => tracing::info!(
            session = %s.id,
            direction = ?s.direction,
            peer = %s.peer,
            file = %s.file_name,
            size = s.total,
            message = s.message.as_deref().unwrap_or(""),
            "transfer started"
        ),
        Event::TransferProgress { session, bytes, total } => {
            tracing::trace!(session = %session, bytes, total, "transfer progress")
        }
        Event::TransferCompleted(s) => tracing::info!(
            session = %s.id,
            file = %s.file_name,
            bytes = s.bytes,
            elapsed_ms = s.started.elapsed().as_millis() as u64,
            "transfer complete"
        ),
        Event::TransferFailed { snapshot: s, kind } => tracing::warn!(
            session = %s.id,
            file = %s.file_name,
            kind = %kind,
            error = s.error.as_deref().unwrap_or(""),
            "transfer failed"
        ),
        Event::TransferCancelled(s) => {
            tracing::info!(session = %s.id, file = %s.file_name, "transfer cancelled")
        }
    }
}
