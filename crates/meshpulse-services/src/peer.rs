//! Peer registry: tracks nearby peers from their discovery beacons.
//!
//! The registry is the only state shared between discovery and transfers.
//! All mutation goes through `upsert` and `sweep`; readers get cloned
//! `PeerRecord` snapshots. Events are published after the map update has
//! finished so that no shard lock is held while subscribers are woken.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use meshpulse_core::wire::Announcement;

use crate::events::{Event, EventBus};

/// Liveness of a peer as judged by beacon age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Missed beacons but still within the TTL.
    Stale,
    /// Past the TTL. Only ever seen on removal events.
    Expired,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Liveness::Alive => "alive",
            Liveness::Stale => "stale",
            Liveness::Expired => "expired",
        })
    }
}

/// Tracked state for a discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    /// Datagram source IP and the announced transfer port.
    pub addr: SocketAddr,
    /// Receipt time of the newest accepted beacon.
    pub last_seen: Instant,
    pub last_seq: u64,
    pub status: Liveness,
}

/// What an upsert did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    /// Address, name, or liveness changed.
    Updated,
    /// Only last-seen moved.
    Refreshed,
    /// Older sequence number than already accepted.
    Ignored,
}

/// Result of one eviction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: usize,
    pub removed: usize,
}

/// The peer registry, shared between the discovery tasks and the
/// transfer engine. Cheap to clone.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<DashMap<String, PeerRecord>>,
    events: EventBus,
}

impl PeerRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Insert or refresh a peer from a validated beacon received at `now`.
    pub fn upsert(&self, ann: &Announcement, source: IpAddr, now: Instant) -> Upsert {
        let addr = SocketAddr::new(source, ann.port);

        let (outcome, record) = match self.peers.entry(ann.id.clone()) {
            Entry::Occupied(mut slot) => {
                let rec = slot.get_mut();
                if ann.seq < rec.last_seq {
                    return Upsert::Ignored;
                }
                let changed =
                    rec.addr != addr || rec.name != ann.name || rec.status != Liveness::Alive;
                rec.addr = addr;
                rec.name.clone_from(&ann.name);
                rec.last_seq = ann.seq;
                rec.status = Liveness::Alive;
                if now > rec.last_seen {
                    rec.last_seen = now;
                }
                if changed {
                    (Upsert::Updated, rec.clone())
                } else {
                    return Upsert::Refreshed;
                }
            }
            Entry::Vacant(slot) => {
                let rec = PeerRecord {
                    id: ann.id.clone(),
                    name: ann.name.clone(),
                    addr,
                    last_seen: now,
                    last_seq: ann.seq,
                    status: Liveness::Alive,
                };
                slot.insert(rec.clone());
                (Upsert::Added, rec)
            }
        };

        match outcome {
            Upsert::Added => {
                tracing::info!(peer = %record.id, name = %record.name, addr = %record.addr, "peer discovered");
                self.events.publish(Event::PeerAdded(record));
            }
            _ => {
                tracing::debug!(peer = %record.id, addr = %record.addr, "peer updated");
                self.events.publish(Event::PeerUpdated(record));
            }
        }
        outcome
    }

    pub fn get(&self, id: &str) -> Option<PeerRecord> {
        self.peers.get(id).map(|r| r.value().clone())
    }

    /// Look a peer up by id, then by display name.
    ///
    /// Several peers may share a name; the most recently seen wins.
    pub fn resolve(&self, query: &str) -> Option<PeerRecord> {
        if let Some(rec) = self.get(query) {
            return Some(rec);
        }
        self.peers
            .iter()
            .filter(|r| r.name == query)
            .max_by_key(|r| r.last_seen)
            .map(|r| r.value().clone())
    }

    /// Find the peer announcing from a given IP, if any.
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<PeerRecord> {
        self.peers
            .iter()
            .find(|r| r.addr.ip() == ip)
            .map(|r| r.value().clone())
    }

    /// All live records, sorted by display name then id.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.iter().map(|r| r.value().clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    /// Age every record against `now`: older than `ttl` is removed,
    /// older than `stale_after` is marked STALE.
    pub fn sweep(&self, now: Instant, stale_after: Duration, ttl: Duration) -> SweepReport {
        let mut went_stale = Vec::new();
        let mut removed = Vec::new();

        self.peers.retain(|_, rec| {
            let age = now.saturating_duration_since(rec.last_seen);
            if age > ttl {
                let mut gone = rec.clone();
                gone.status = Liveness::Expired;
                removed.push(gone);
                false
            } else {
                if age > stale_after && rec.status == Liveness::Alive {
                    rec.status = Liveness::Stale;
                    went_stale.push(rec.clone());
                }
                true
            }
        });

        let report = SweepReport {
            stale: went_stale.len(),
            removed: removed.len(),
        };
        for rec in went_stale {
            tracing::debug!(peer = %rec.id, "peer stale");
            self.events.publish(Event::PeerUpdated(rec));
        }
        for rec in removed {
            tracing::info!(peer = %rec.id, name = %rec.name, "peer expired");
            self.events.publish(Event::PeerRemoved(rec));
        }
        report
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
