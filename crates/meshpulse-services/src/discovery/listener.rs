//! Beacon listener and eviction sweep.
//!
//! Valid beacons from other nodes are upserted into the peer registry;
//! malformed ones are dropped at trace level. A receive error never ends
//! the loop.

use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time;

use meshpulse_core::wire::{Announcement, MAX_DATAGRAM};

use crate::peer::Upsert;

use super::Discovery;

impl Discovery {
    /// Interpret one datagram received from `source` at `now`.
    ///
    /// Returns None when the datagram was dropped.
    pub fn handle_datagram(&self, bytes: &[u8], source: SocketAddr, now: Instant) -> Option<Upsert> {
        let ann = match Announcement::decode(bytes) {
            Ok(a) => a,
            Err(e) => {
                tracing::trace!(error = %e, from = %source, "dropping malformed beacon");
                return None;
            }
        };
        if ann.id == self.identity.peer_id {
            tracing::trace!("ignoring own beacon");
            return None;
        }
        Some(self.registry.upsert(&ann, source.ip(), now))
    }

    /// Receive beacons until shutdown.
    pub async fn listen_loop(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        // One spare byte so an oversized datagram is seen as oversized.
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];

        tracing::info!(addr = %self.settings.listen_addr, "beacon listener starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("beacon listener shutting down");
                    return Ok(());
                }
                received = self.listen.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => {
                            self.handle_datagram(&buf[..len], source, Instant::now());
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                        }
                    }
                }
            }
        }
    }

    /// Age the registry every sweep interval until shutdown.
    pub async fn sweep_loop(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut interval = time::interval(self.settings.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("registry sweep shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    let report = self.registry.sweep(
                        Instant::now(),
                        self.settings.stale_after,
                        self.settings.ttl,
                    );
                    if report.removed > 0 || report.stale > 0 {
                        tracing::debug!(
                            removed = report.removed,
                            stale = report.stale,
                            remaining = self.registry.len(),
                            "registry swept"
                        );
                    }
                }
            }
        }
    }
}
