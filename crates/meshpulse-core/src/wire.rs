//! Mesh-Pulse wire format: every byte that crosses the network.
//!
//! Two protocols live here:
//!   1. The discovery beacon, a small JSON datagram broadcast over UDP.
//!      JSON so that unknown fields from newer peers are simply ignored.
//!   2. The transfer stream over TCP. Fixed-size frame headers are
//!      `#[repr(C)]` zerocopy structs built from big-endian integer
//!      wrappers, so they have alignment 1, no padding, and a layout that
//!      is identical on every platform. The variable-length handshake body
//!      is JSON behind a fixed prelude.
//!
//! Stream layout, in order:
//!
//! ```text
//! initiator → HeaderPrelude + TransferHeader(JSON)
//! responder → HandshakeReply
//! initiator → { ChunkFrameHeader + ciphertext + tag }*   (index 0, 1, 2, …)
//! initiator → EndFrame
//! responder → Outcome
//! ```
//!
//! There is no unsafe code in this module.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Transfer protocol version carried in every handshake prelude.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Magic bytes opening every transfer stream.
pub const STREAM_MAGIC: [u8; 4] = *b"MPLS";

/// Default UDP port for discovery beacons.
pub const DEFAULT_BROADCAST_PORT: u16 = 37020;

/// Default TCP port for transfers.
pub const DEFAULT_TRANSFER_PORT: u16 = 5000;

/// Plaintext bytes per encrypted chunk. Fixed per build.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size a receiver will accept from a header.
/// Bounds receiver memory to O(chunk) no matter what the sender claims.
pub const MAX_CHUNK_SIZE: u32 = 1024 * 1024;

/// Poly1305 tag length appended to every chunk frame.
pub const TAG_LEN: usize = 16;

/// Random per-session seed length (nonce prefix + subkey salt).
pub const SEED_LEN: usize = 16;

/// Maximum JSON body following a HeaderPrelude.
pub const HEADER_MAX_SIZE: usize = 4096;

/// Maximum discovery datagram size.
pub const MAX_DATAGRAM: usize = 4096;

/// Maximum received file name length in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of the optional text message in a header.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Maximum peer id / display name length in a beacon.
pub const MAX_PEER_FIELD_LEN: usize = 128;

// ── Discovery beacon ──────────────────────────────────────────────────────────

/// Presence beacon broadcast by every node on the discovery port.
///
/// The announcing address is taken from the datagram source, never from
/// the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Stable peer id: `<hostname>-<instance hex>`.
    pub id: String,
    /// Human readable display name.
    pub name: String,
    /// TCP port on which the peer accepts transfers.
    pub port: u16,
    /// Monotonic per-process announcement counter.
    pub seq: u64,
}

impl Announcement {
    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let bytes = serde_json::to_vec(self).map_err(|e| WireError::Json(e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(WireError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Parse and structurally validate a received datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_DATAGRAM {
            return Err(WireError::TooLarge(bytes.len()));
        }
        let ann: Announcement =
            serde_json::from_slice(bytes).map_err(|e| WireError::Json(e.to_string()))?;
        if ann.id.is_empty() || ann.id.len() > MAX_PEER_FIELD_LEN {
            return Err(WireError::InvalidField("id"));
        }
        if ann.name.len() > MAX_PEER_FIELD_LEN {
            return Err(WireError::InvalidField("name"));
        }
        if ann.port == 0 {
            return Err(WireError::InvalidField("port"));
        }
        Ok(ann)
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Fixed prelude opening a transfer stream.
///
/// Carries the protocol version so that a receiver can reject an
/// incompatible sender before it parses anything else.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct HeaderPrelude {
    pub magic: [u8; 4],
    pub version: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 3],
    /// Length of the JSON TransferHeader that follows.
    pub body_len: U32<BigEndian>,
}

assert_eq_size!(HeaderPrelude, [u8; 12]);

impl HeaderPrelude {
    pub fn new(body_len: usize) -> Self {
        Self {
            magic: STREAM_MAGIC,
            version: PROTOCOL_VERSION,
            reserved: [0u8; 3],
            body_len: U32::new(body_len as u32),
        }
    }
}

/// Handshake body describing the file about to be streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub file_name: String,
    pub size: u64,
    pub chunk_size: u32,
    /// Hex-encoded SEED_LEN random bytes.
    pub seed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TransferHeader {
    /// Decode the hex seed into its fixed-size form.
    pub fn seed_bytes(&self) -> Result<[u8; SEED_LEN], WireError> {
        let raw = hex::decode(&self.seed).map_err(|_| WireError::InvalidField("seed"))?;
        raw.try_into().map_err(|_| WireError::InvalidField("seed"))
    }

    /// Number of chunk frames this header implies.
    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.size.div_ceil(u64::from(self.chunk_size))
    }
}

/// Reply status byte.
pub const REPLY_ACCEPT: u8 = 0x00;
pub const REPLY_REJECT: u8 = 0x01;

/// Responder's answer to a header.
///
/// Wire size: 2 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct HandshakeReply {
    pub status: u8,
    /// RejectReason byte, zero on accept.
    pub reason: u8,
}

assert_eq_size!(HandshakeReply, [u8; 2]);

impl HandshakeReply {
    pub fn accept() -> Self {
        Self { status: REPLY_ACCEPT, reason: 0 }
    }

    pub fn reject(reason: RejectReason) -> Self {
        Self { status: REPLY_REJECT, reason: reason.into() }
    }
}

/// Why a responder refused a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    UnsupportedVersion = 0x01,
    /// The receiver is not accepting transfers.
    Declined = 0x02,
    MalformedHeader = 0x03,
    TooLarge = 0x04,
}

impl TryFrom<u8> for RejectReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(RejectReason::UnsupportedVersion),
            0x02 => Ok(RejectReason::Declined),
            0x03 => Ok(RejectReason::MalformedHeader),
            0x04 => Ok(RejectReason::TooLarge),
            other => Err(WireError::UnknownCode(other)),
        }
    }
}

impl From<RejectReason> for u8 {
    fn from(r: RejectReason) -> u8 {
        r as u8
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::UnsupportedVersion => "unsupported protocol version",
            RejectReason::Declined => "peer declined",
            RejectReason::MalformedHeader => "malformed header",
            RejectReason::TooLarge => "file too large",
        };
        f.write_str(s)
    }
}

// ── Stream frames ─────────────────────────────────────────────────────────────

/// Frame kind bytes. The first byte of every post-handshake frame.
pub const FRAME_CHUNK: u8 = 0x02;
pub const FRAME_END: u8 = 0x03;
pub const FRAME_OUTCOME: u8 = 0x04;

/// Precedes `len` ciphertext bytes and a TAG_LEN byte tag.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ChunkFrameHeader {
    pub kind: u8,
    pub index: U32<BigEndian>,
    /// Ciphertext length; equals the plaintext length.
    pub len: U32<BigEndian>,
}

assert_eq_size!(ChunkFrameHeader, [u8; 9]);

impl ChunkFrameHeader {
    pub fn new(index: u32, len: usize) -> Self {
        Self {
            kind: FRAME_CHUNK,
            index: U32::new(index),
            len: U32::new(len as u32),
        }
    }
}

/// End-of-stream marker.
///
/// Wire size: 45 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct EndFrame {
    pub kind: u8,
    /// Number of chunk frames sent.
    pub chunks: U32<BigEndian>,
    /// Total plaintext bytes sent.
    pub total: U64<BigEndian>,
    /// BLAKE3 digest of the whole plaintext.
    pub digest: [u8; 32],
}

assert_eq_size!(EndFrame, [u8; 45]);

impl EndFrame {
    pub fn new(chunks: u32, total: u64, digest: [u8; 32]) -> Self {
        Self {
            kind: FRAME_END,
            chunks: U32::new(chunks),
            total: U64::new(total),
            digest,
        }
    }
}

/// Receiver's final verdict, sent after the end marker or on failure.
///
/// Wire size: 2 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct OutcomeFrame {
    pub kind: u8,
    pub status: u8,
}

assert_eq_size!(OutcomeFrame, [u8; 2]);

impl OutcomeFrame {
    pub fn new(outcome: Outcome) -> Self {
        Self { kind: FRAME_OUTCOME, status: outcome.into() }
    }
}

/// Verdict codes carried in OutcomeFrame.status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Outcome {
    Ok = 0x00,
    SizeMismatch = 0x01,
    IntegrityFailure = 0x02,
    DigestMismatch = 0x03,
    ProtocolError = 0x04,
}

impl TryFrom<u8> for Outcome {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Outcome::Ok),
            0x01 => Ok(Outcome::SizeMismatch),
            0x02 => Ok(Outcome::IntegrityFailure),
            0x03 => Ok(Outcome::DigestMismatch),
            0x04 => Ok(Outcome::ProtocolError),
            other => Err(WireError::UnknownCode(other)),
        }
    }
}

impl From<Outcome> for u8 {
    fn from(o: Outcome) -> u8 {
        o as u8
    }
}

// ── File names ────────────────────────────────────────────────────────────────

/// Reduce a sender-supplied file name to a safe basename.
///
/// Directory components (either separator) are stripped; `.`, `..`,
/// empty names, names with NUL, and names over MAX_NAME_LEN are refused.
pub fn sanitize_file_name(raw: &str) -> Result<String, WireError> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        return Err(WireError::InvalidField("file_name"));
    }
    if base.contains('\0') || base.len() > MAX_NAME_LEN {
        return Err(WireError::InvalidField("file_name"));
    }
    Ok(base.to_string())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("invalid or out-of-range field: {0}")]
    InvalidField(&'static str),

    #[error("message of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("unknown code byte: 0x{0:02x}")]
    UnknownCode(u8),

    #[error("bad stream magic")]
    BadMagic,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
