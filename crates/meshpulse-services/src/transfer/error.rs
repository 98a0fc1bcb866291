//! Transfer failures and their classification.

use std::path::PathBuf;

use meshpulse_core::crypto::CryptoError;
use meshpulse_core::wire::{Outcome, RejectReason, WireError};

/// Coarse failure class reported with every FAILED session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or unexpected frames, rejected handshakes, size mismatches.
    Protocol,
    /// Authentication failure or digest mismatch. Possible tampering or
    /// a key mismatch.
    Integrity,
    /// Reset, refused, or closed connection.
    Connection,
    /// Handshake or stall deadline exceeded.
    Timeout,
    /// Local file or socket resource problem.
    Resource,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Resource => "resource",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("handshake rejected: {0}")]
    Rejected(RejectReason),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),

    #[error("integrity failure")]
    Integrity,

    #[error("size mismatch: declared {declared} bytes, received {received}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("whole-file digest mismatch")]
    DigestMismatch,

    #[error("peer reported {0:?}")]
    Remote(Outcome),

    #[error("connection error: {0}")]
    Connection(#[source] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("file error on {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk nonce space exhausted")]
    NonceExhausted,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Rejected(_)
            | TransferError::Protocol(_)
            | TransferError::Wire(_)
            | TransferError::SizeMismatch { .. } => ErrorKind::Protocol,
            TransferError::Integrity | TransferError::DigestMismatch => ErrorKind::Integrity,
            TransferError::Remote(Outcome::IntegrityFailure | Outcome::DigestMismatch) => {
                ErrorKind::Integrity
            }
            TransferError::Remote(_) => ErrorKind::Protocol,
            TransferError::Connection(_) | TransferError::ConnectionClosed => {
                ErrorKind::Connection
            }
            TransferError::Timeout(_) => ErrorKind::Timeout,
            TransferError::UnknownPeer(_)
            | TransferError::File { .. }
            | TransferError::NonceExhausted => ErrorKind::Resource,
        }
    }

    /// Verdict a receiver sends back for this failure, if any.
    ///
    /// Connection-level and local failures get none: either the peer is
    /// gone or the problem is not the peer's.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            TransferError::Integrity => Some(Outcome::IntegrityFailure),
            TransferError::DigestMismatch => Some(Outcome::DigestMismatch),
            TransferError::SizeMismatch { .. } => Some(Outcome::SizeMismatch),
            TransferError::Protocol(_) | TransferError::Wire(_) => Some(Outcome::ProtocolError),
            _ => None,
        }
    }

    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::File {
            path: path.into(),
            source,
        }
    }
}

impl From<CryptoError> for TransferError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Integrity => TransferError::Integrity,
            CryptoError::NonceExhausted => TransferError::NonceExhausted,
            CryptoError::KeyDerivation => TransferError::Protocol(e.to_string()),
        }
    }
}

/// Map a socket error, treating a mid-frame EOF as the peer closing.
pub(crate) fn io_to_transfer(e: std::io::Error) -> TransferError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransferError::ConnectionClosed
    } else {
        TransferError::Connection(e)
    }
}
