//! Session tracking: one entry per transfer attempt.
//!
//! A session's mutable state lives in the `SessionHandle` owned by its
//! handler task. The shared `SessionTable` only ever holds published
//! snapshots plus the cancellation switch.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;

use crate::events::{Event, EventBus, ProgressThrottle};

use super::error::{ErrorKind, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    Handshaking,
    Transferring,
    Complete,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Failed | TransferState::Cancelled
        )
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Init, Handshaking) | (Handshaking, Transferring) | (Transferring, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            (Handshaking | Transferring, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransferState::Init => "INIT",
            TransferState::Handshaking => "HANDSHAKING",
            TransferState::Transferring => "TRANSFERRING",
            TransferState::Complete => "COMPLETE",
            TransferState::Failed => "FAILED",
            TransferState::Cancelled => "CANCELLED",
        })
    }
}

/// Immutable view of a session at one point in time.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub id: SessionId,
    pub direction: Direction,
    /// Peer id if known, else the remote address.
    pub peer: String,
    pub remote: SocketAddr,
    pub file_name: String,
    pub total: u64,
    pub bytes: u64,
    pub state: TransferState,
    /// Present only in FAILED.
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Optional note carried in the header.
    pub message: Option<String>,
    pub started: Instant,
}

struct SessionEntry {
    snapshot: TransferSnapshot,
    cancel: watch::Sender<bool>,
}

/// Active and recently finished sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionTable {
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
    next_id: Arc<AtomicU64>,
    events: EventBus,
    /// Minimum spacing of progress events per session.
    progress_interval: Duration,
    /// How long a finished session stays queryable.
    grace: Duration,
}

impl SessionTable {
    pub fn new(events: EventBus, progress_interval: Duration, grace: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            events,
            progress_interval,
            grace,
        }
    }

    /// Register a new session in INIT and hand its handle to the caller.
    pub(crate) fn open(
        &self,
        direction: Direction,
        peer: String,
        remote: SocketAddr,
        file_name: String,
    ) -> SessionHandle {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let snapshot = TransferSnapshot {
            id,
            direction,
            peer,
            remote,
            file_name,
            total: 0,
            bytes: 0,
            state: TransferState::Init,
            error: None,
            error_kind: None,
            message: None,
            started: Instant::now(),
        };
        let (cancel, cancel_rx) = watch::channel(false);
        self.sessions.insert(
            id,
            SessionEntry {
                snapshot: snapshot.clone(),
                cancel,
            },
        );
        SessionHandle {
            table: self.clone(),
            events: self.events.clone(),
            snapshot,
            throttle: ProgressThrottle::new(self.progress_interval),
            grace: self.grace,
            cancel_rx,
            announced: false,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<TransferSnapshot> {
        self.sessions.get(&id).map(|e| e.snapshot.clone())
    }

    /// All tracked sessions, oldest first.
    pub fn list(&self) -> Vec<TransferSnapshot> {
        let mut all: Vec<_> = self.sessions.iter().map(|e| e.snapshot.clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Request cancellation. False if the session is unknown or finished.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.sessions.get(&id) {
            Some(entry) if !entry.snapshot.state.is_terminal() => {
                entry.cancel.send_replace(true);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn store(&self, snapshot: &TransferSnapshot) {
        if let Some(mut entry) = self.sessions.get_mut(&snapshot.id) {
            entry.snapshot = snapshot.clone();
        }
    }

    fn release(&self, id: SessionId) {
        self.sessions.remove(&id);
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// The handler-owned side of a session.
pub(crate) struct SessionHandle {
    table: SessionTable,
    events: EventBus,
    snapshot: TransferSnapshot,
    throttle: ProgressThrottle,
    grace: Duration,
    cancel_rx: watch::Receiver<bool>,
    announced: bool,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.snapshot.id
    }

    pub fn state(&self) -> TransferState {
        self.snapshot.state
    }

    pub fn snapshot(&self) -> &TransferSnapshot {
        &self.snapshot
    }

    /// A receiver that resolves once cancellation is requested.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    /// Record what is being transferred and announce the session.
    pub fn describe(&mut self, file_name: &str, total: u64, message: Option<String>) {
        self.snapshot.file_name = file_name.to_string();
        self.snapshot.total = total;
        self.snapshot.message = message;
        self.table.store(&self.snapshot);
        self.announce();
    }

    /// Publish TransferStarted once.
    pub fn announce(&mut self) {
        if !self.announced {
            self.announced = true;
            self.events
                .publish(Event::TransferStarted(self.snapshot.clone()));
        }
    }

    /// Move to a non-terminal state. Illegal moves are refused and logged.
    pub fn transition(&mut self, next: TransferState) -> bool {
        let from = self.snapshot.state;
        if !from.can_transition_to(next) {
            tracing::debug!(session = %self.id(), %from, to = %next, "refused state transition");
            return false;
        }
        self.snapshot.state = next;
        self.table.store(&self.snapshot);
        tracing::debug!(session = %self.id(), %from, to = %next, "session state");
        true
    }

    /// Count `n` more bytes as transferred and maybe emit progress.
    pub fn advance(&mut self, n: u64) {
        let s = &mut self.snapshot;
        s.bytes = s.bytes.saturating_add(n).min(s.total);
        let (bytes, total) = (s.bytes, s.total);
        self.table.store(&self.snapshot);
        if self.throttle.should_emit(Instant::now(), bytes, total) {
            self.events.publish(Event::TransferProgress {
                session: self.id(),
                bytes,
                total,
            });
        }
    }

    pub fn complete(mut self) -> TransferSnapshot {
        if self.transition(TransferState::Complete) {
            tracing::info!(
                session = %self.id(),
                file = %self.snapshot.file_name,
                bytes = self.snapshot.bytes,
                peer = %self.snapshot.peer,
                "transfer complete"
            );
            self.events
                .publish(Event::TransferCompleted(self.snapshot.clone()));
        }
        self.finish()
    }

    pub fn fail(mut self, error: &TransferError) -> TransferSnapshot {
        let from = self.snapshot.state;
        if from.can_transition_to(TransferState::Failed) {
            self.announce();
            let kind = error.kind();
            self.snapshot.state = TransferState::Failed;
            self.snapshot.error = Some(error.to_string());
            self.snapshot.error_kind = Some(kind);
            self.table.store(&self.snapshot);
            tracing::warn!(
                session = %self.id(),
                %from,
                %kind,
                error = %error,
                peer = %self.snapshot.peer,
                "transfer failed"
            );
            self.events.publish(Event::TransferFailed {
                snapshot: self.snapshot.clone(),
                kind,
            });
        }
        self.finish()
    }

    pub fn cancelled(mut self) -> TransferSnapshot {
        if self.transition(TransferState::Cancelled) {
            self.announce();
            tracing::info!(session = %self.id(), bytes = self.snapshot.bytes, "transfer cancelled");
            self.events
                .publish(Event::TransferCancelled(self.snapshot.clone()));
        }
        self.finish()
    }

    /// Keep the final snapshot queryable for the grace period, then drop it.
    fn finish(self) -> TransferSnapshot {
        let id = self.id();
        let table = self.table.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            table.release(id);
        });
        self.snapshot
    }
}

/// How a handler ended short of an error.
pub(crate) enum Flow {
    /// Finished; the receiver also reports where the file landed.
    Done(Option<PathBuf>),
    Cancelled,
}

/// Resolves once cancellation is requested; never if the switch is gone.
pub(crate) async fn cancel_requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(bus: &EventBus, grace: Duration) -> SessionTable {
        SessionTable::new(bus.clone(), Duration::from_millis(100), grace)
    }

    fn open(table: &SessionTable) -> SessionHandle {
        table.open(
            Direction::Send,
            "peer-a".into(),
            "127.0.0.1:5000".parse().unwrap(),
            "f.bin".into(),
        )
    }

    #[test]
    fn state_machine_transitions() {
        use TransferState::*;
        assert!(Init.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Transferring));
        assert!(Transferring.can_transition_to(Complete));
        assert!(Init.can_transition_to(Failed));
        assert!(Transferring.can_transition_to(Failed));
        assert!(Handshaking.can_transition_to(Cancelled));
        assert!(Transferring.can_transition_to(Cancelled));

        assert!(!Init.can_transition_to(Cancelled));
        assert!(!Init.can_transition_to(Transferring));
        assert!(!Handshaking.can_transition_to(Complete));
        for terminal in [Complete, Failed, Cancelled] {
            for next in [Init, Handshaking, Transferring, Complete, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[tokio::test]
    async fn ids_are_unique_and_snapshots_published() {
        let table = table(&EventBus::new(), Duration::from_secs(30));
        let mut a = open(&table);
        let b = open(&table);
        assert_ne!(a.id(), b.id());

        a.describe("f.bin", 100, None);
        a.transition(TransferState::Handshaking);
        a.transition(TransferState::Transferring);
        a.advance(40);
        let snap = table.get(a.id()).unwrap();
        assert_eq!(snap.state, TransferState::Transferring);
        assert_eq!(snap.bytes, 40);
        assert_eq!(table.list().len(), 2);
    }

    #[tokio::test]
    async fn progress_never_exceeds_total() {
        let table = table(&EventBus::new(), Duration::from_secs(30));
        let mut h = open(&table);
        h.describe("f.bin", 10, None);
        h.advance(7);
        h.advance(7);
        assert_eq!(h.snapshot().bytes, 10);
    }

    #[tokio::test]
    async fn cancel_only_applies_to_live_sessions() {
        let table = table(&EventBus::new(), Duration::from_secs(30));
        let h = open(&table);
        let id = h.id();
        let signal = h.cancel_signal();

        assert!(table.cancel(id));
        assert!(*signal.borrow());
        assert!(!table.cancel(SessionId(9999)));

        let snap = h.fail(&TransferError::ConnectionClosed);
        assert_eq!(snap.state, TransferState::Failed);
        assert!(!table.cancel(id));
    }

    #[tokio::test]
    async fn terminal_events_and_release_after_grace() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let table = table(&bus, Duration::from_millis(50));
        let mut h = open(&table);
        let id = h.id();
        h.describe("f.bin", 0, Some("hi".into()));
        h.transition(TransferState::Handshaking);
        let snap = h.cancelled();
        assert_eq!(snap.state, TransferState::Cancelled);
        assert_eq!(snap.message.as_deref(), Some("hi"));

        assert!(matches!(rx.recv().await.unwrap(), Event::TransferStarted(_)));
        assert!(matches!(rx.recv().await.unwrap(), Event::TransferCancelled(_)));

        assert!(table.get(id).is_some());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(table.get(id).is_none());
    }

    #[tokio::test]
    async fn failed_snapshot_carries_error_detail() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let table = table(&bus, Duration::from_secs(30));
        let mut h = open(&table);
        h.transition(TransferState::Handshaking);
        h.transition(TransferState::Transferring);
        let snap = h.fail(&TransferError::Integrity);
        assert_eq!(snap.error_kind, Some(ErrorKind::Integrity));
        assert_eq!(snap.error.as_deref(), Some("integrity failure"));

        let Event::TransferFailed { kind, .. } = rx.recv().await.unwrap() else {
            panic!("expected failure event");
        };
        assert_eq!(kind, ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn early_failure_still_announces_the_session() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let table = table(&bus, Duration::from_secs(30));
        let h = open(&table);
        let id = h.id();
        h.fail(&TransferError::ConnectionClosed);

        let Event::TransferStarted(started) = rx.recv().await.unwrap() else {
            panic!("failure published before the session was announced");
        };
        assert_eq!(started.id, id);
        assert!(matches!(rx.recv().await.unwrap(), Event::TransferFailed { .. }));
    }

    #[tokio::test]
    async fn announce_happens_once() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let table = table(&bus, Duration::from_secs(30));
        let mut h = open(&table);
        h.describe("f.bin", 3, None);
        h.transition(TransferState::Handshaking);
        h.cancelled();

        assert!(matches!(rx.recv().await.unwrap(), Event::TransferStarted(_)));
        assert!(matches!(rx.recv().await.unwrap(), Event::TransferCancelled(_)));
        assert!(rx.try_recv().is_err());
    }
}
