//! Cryptographic primitives for Mesh-Pulse.
//!
//! Provides three things:
//!   1. BLAKE3 hashing for the whole-file digest carried in the end marker
//!   2. Shared-key derivation from the configured secret (HKDF-SHA256)
//!   3. Per-session chunk sealing with ChaCha20-Poly1305
//!
//! The shared key never leaves the process. Each transfer derives its own
//! subkey from the shared key and a random seed sent in the clear, so two
//! sessions never encrypt under the same key even with identical secrets.
//!
//! All key material derives ZeroizeOnDrop.
//! There is no unsafe code in this module.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::{SEED_LEN, TAG_LEN};

const SHARED_KEY_SALT: &[u8] = b"mesh-pulse/v1/salt";
const SHARED_KEY_INFO: &[u8] = b"mesh-pulse/v1/shared-key";
const CHUNK_KEY_INFO: &[u8] = b"mesh-pulse/v1/chunk-key";

/// Highest chunk index a session may seal. Indices travel as u32.
pub const MAX_CHUNKS: u64 = u32::MAX as u64 + 1;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use meshpulse_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, meshpulse_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Shared key ────────────────────────────────────────────────────────────────

/// Symmetric key derived from the configured secret.
///
/// Every node configured with the same secret derives the same key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey {
    bytes: [u8; 32],
}

impl SharedKey {
    /// Expand a secret into a 32-byte key with HKDF-SHA256.
    pub fn derive(secret: &str) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(SHARED_KEY_SALT), secret.as_bytes());
        let mut bytes = [0u8; 32];
        hk.expand(SHARED_KEY_INFO, &mut bytes)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(Self { bytes })
    }

    /// Short non-secret fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&hash(&self.bytes)[..4])
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedKey({})", self.fingerprint())
    }
}

/// Generate a fresh random session seed.
///
/// Uses the OS CSPRNG via rand::thread_rng.
pub fn generate_seed() -> [u8; SEED_LEN] {
    let mut seed = [0u8; SEED_LEN];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

// ── Chunk cipher ──────────────────────────────────────────────────────────────

/// Per-session AEAD state.
///
/// One side seals, the other opens; both walk the chunk index forward
/// from zero and never reuse it.
pub struct ChunkCipher {
    aead: ChaCha20Poly1305,
    nonce_prefix: [u8; 4],
    total: u64,
    next: u64,
}

impl ChunkCipher {
    /// Derive the session subkey from the shared key and seed.
    ///
    /// `total` is the declared file size; it is bound into every chunk's
    /// associated data.
    pub fn new(key: &SharedKey, seed: &[u8; SEED_LEN], total: u64) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(&seed[..]), &key.bytes);
        let mut subkey = zeroize::Zeroizing::new([0u8; 32]);
        hk.expand(CHUNK_KEY_INFO, &mut subkey[..])
            .map_err(|_| CryptoError::KeyDerivation)?;

        let mut nonce_prefix = [0u8; 4];
        nonce_prefix.copy_from_slice(&seed[..4]);

        Ok(Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&subkey[..])),
            nonce_prefix,
            total,
            next: 0,
        })
    }

    /// Index the next seal or open will use.
    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Encrypt `buf` in place under the next index.
    ///
    /// Returns the index used and the detached tag.
    pub fn seal_next(&mut self, buf: &mut [u8]) -> Result<(u32, [u8; TAG_LEN]), CryptoError> {
        if self.next >= MAX_CHUNKS {
            return Err(CryptoError::NonceExhausted);
        }
        let index = self.next as u32;
        let tag = self
            .aead
            .encrypt_in_place_detached(&self.nonce(index), &aad(index, self.total), buf)
            .map_err(|_| CryptoError::Integrity)?;
        self.next += 1;

        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(tag.as_slice());
        Ok((index, out))
    }

    /// Decrypt `buf` in place, expecting it to be the next chunk in order.
    ///
    /// The frame is always opened under the locally expected index, so a
    /// reordered or replayed frame fails authentication even if its
    /// declared index was forged to match.
    pub fn open_next(
        &mut self,
        declared_index: u32,
        buf: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<u32, CryptoError> {
        if self.next >= MAX_CHUNKS || u64::from(declared_index) != self.next {
            return Err(CryptoError::Integrity);
        }
        let index = self.next as u32;
        self.aead
            .decrypt_in_place_detached(
                &self.nonce(index),
                &aad(index, self.total),
                buf,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::Integrity)?;
        self.next += 1;
        Ok(index)
    }

    fn nonce(&self, index: u32) -> Nonce {
        let mut n = [0u8; 12];
        n[..4].copy_from_slice(&self.nonce_prefix);
        n[4..].copy_from_slice(&u64::from(index).to_be_bytes());
        Nonce::clone_from_slice(&n)
    }
}

fn aad(index: u32, total: u64) -> [u8; 12] {
    let mut a = [0u8; 12];
    a[..4].copy_from_slice(&index.to_be_bytes());
    a[4..].copy_from_slice(&total.to_be_bytes());
    a
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Any authentication failure. Deliberately carries no detail.
    #[error("integrity failure")]
    Integrity,

    #[error("chunk nonce space exhausted")]
    NonceExhausted,

    #[error("key derivation failed")]
    KeyDerivation,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
