//! Event surface: what the dashboard and metrics collector observe.
//!
//! A single broadcast channel carries peer and transfer events. Producers
//! never wait on consumers: a receiver that falls more than the channel
//! capacity behind loses the oldest events and sees `RecvError::Lagged`.

use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::peer::PeerRecord;
use crate::transfer::{ErrorKind, SessionId, TransferSnapshot};

/// Events buffered per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    PeerAdded(PeerRecord),
    /// Liveness, address, or display name changed.
    PeerUpdated(PeerRecord),
    /// Carries the record as it was at eviction, status EXPIRED.
    PeerRemoved(PeerRecord),
    TransferStarted(TransferSnapshot),
    TransferProgress {
        session: SessionId,
        bytes: u64,
        total: u64,
    },
    TransferCompleted(TransferSnapshot),
    TransferFailed {
        snapshot: TransferSnapshot,
        kind: ErrorKind,
    },
    TransferCancelled(TransferSnapshot),
}

impl Event {
    /// Session this event belongs to, if it is a transfer event.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Event::TransferStarted(s)
            | Event::TransferCompleted(s)
            | Event::TransferCancelled(s)
            | Event::TransferFailed { snapshot: s, .. } => Some(s.id),
            Event::TransferProgress { session, .. } => Some(*session),
            _ => None,
        }
    }

    /// Final snapshot if this event ends a session.
    pub fn terminal(&self) -> Option<&TransferSnapshot> {
        match self {
            Event::TransferCompleted(s)
            | Event::TransferCancelled(s)
            | Event::TransferFailed { snapshot: s, .. } => Some(s),
            _ => None,
        }
    }
}

/// Cloneable publishing handle.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber. Having none is fine.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for the terminal event of one session.
///
/// Returns None if the bus closes first. Lagging is tolerated; the caller
/// should subscribe before the session is started.
pub async fn wait_for_terminal(
    rx: &mut broadcast::Receiver<Event>,
    id: SessionId,
) -> Option<TransferSnapshot> {
    loop {
        match rx.recv().await {
            Ok(event) if event.session() == Some(id) => {
                if let Some(snapshot) = event.terminal() {
                    return Some(snapshot.clone());
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

// ── Progress throttle ─────────────────────────────────────────────────────────

/// Coalesces per-chunk progress into at most one event per interval.
///
/// The final value (bytes == total) always passes.
#[derive(Debug)]
pub struct ProgressThrottle {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant, bytes: u64, total: u64) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        };
        if due || bytes >= total {
            self.last_emit = Some(now);
            true
        } else {
            false
        }
    }
}
