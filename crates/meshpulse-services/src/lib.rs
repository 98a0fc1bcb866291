//! meshpulse-services: peer discovery, the live peer registry, and the
//! encrypted transfer engine. Everything here is runtime state layered over
//! the formats defined in `meshpulse-core`.

pub mod discovery;
pub mod events;
pub mod peer;
pub mod transfer;

pub use discovery::{Discovery, DiscoverySettings, LocalIdentity};
pub use events::{wait_for_terminal, Event, EventBus, ProgressThrottle};
pub use peer::{Liveness, PeerRecord, PeerRegistry, SweepReport, Upsert};
pub use transfer::{
    Direction, ErrorKind, SessionId, SessionTable, TransferEngine, TransferError,
    TransferSettings, TransferSnapshot, TransferState,
};
