//! meshpulse-core: wire format, cryptographic primitives, and configuration.
//! All other Mesh-Pulse crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use config::MeshConfig;
pub use crypto::{ChunkCipher, CryptoError, SharedKey};
pub use wire::{Announcement, TransferHeader, WireError};
