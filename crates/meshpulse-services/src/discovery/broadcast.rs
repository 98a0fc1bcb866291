//! Beacon broadcast.
//!
//! Periodically sends this node's Announcement to the broadcast address
//! so nearby peers can discover it. Best effort: a failed send is logged
//! and the next tick tries again.

use std::sync::atomic::Ordering;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time;

use meshpulse_core::wire::Announcement;

use super::Discovery;

impl Discovery {
    /// Build the next beacon, advancing the sequence number.
    pub(crate) fn next_announcement(&self) -> Announcement {
        Announcement {
            id: self.identity.peer_id.clone(),
            name: self.identity.name.clone(),
            port: self.identity.transfer_port,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Send one beacon. Errors are logged, never returned.
    pub async fn announce_once(&self) {
        let ann = self.next_announcement();
        let bytes = match ann.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode announcement");
                return;
            }
        };
        match self.send.send_to(&bytes, self.settings.announce_to).await {
            Ok(n) => tracing::trace!(bytes = n, seq = ann.seq, "beacon sent"),
            Err(e) => tracing::warn!(error = %e, dest = %self.settings.announce_to, "beacon send failed"),
        }
    }

    /// Broadcast a beacon every announce interval until shutdown.
    pub async fn announce_loop(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut interval = time::interval(self.settings.announce_interval);

        tracing::info!(
            dest = %self.settings.announce_to,
            interval_ms = self.settings.announce_interval.as_millis() as u64,
            "beacon broadcast starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("beacon broadcast shutting down");
                    return Ok(());
                }
                _ = interval.tick() => self.announce_once().await,
            }
        }
    }
}
