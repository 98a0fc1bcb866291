//! Encrypted point-to-point file transfer over TCP.
//!
//! One connection carries exactly one file:
//!
//! ```text
//! sender                              receiver
//!   ── prelude + JSON header ──────────▶
//!   ◀───────────────────── accept/reject
//!   ── chunk frames (sealed) ──────────▶
//!   ── end marker (count, size, digest) ▶
//!   ◀────────────────────────── outcome
//! ```
//!
//! [`TransferEngine`] owns the listener, spawns one task per session and
//! records every session in a [`SessionTable`].

mod engine;
mod error;
pub mod frame;
mod receiver;
mod sender;
mod session;

pub use engine::{TransferEngine, TransferSettings};
pub use error::{ErrorKind, TransferError};
pub use session::{Direction, SessionId, SessionTable, TransferSnapshot, TransferState};
