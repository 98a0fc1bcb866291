//! Receiving side of one transfer.
//!
//! Plaintext is streamed into a hidden `.part` file next to its final
//! location. The partial file is removed on every path except success,
//! including when the handler future is dropped mid-transfer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use meshpulse_core::crypto::{ChunkCipher, Hasher, SharedKey};
use meshpulse_core::wire::{
    sanitize_file_name, HandshakeReply, Outcome, RejectReason, TransferHeader, MAX_CHUNK_SIZE,
    MAX_MESSAGE_LEN, SEED_LEN,
};

use super::engine::TransferSettings;
use super::error::TransferError;
use super::frame::{self, deadline, IncomingHeader, StreamFrame};
use super::session::{SessionHandle, TransferState};

/// Longest prefix of the file name used in the partial file's name.
const PART_NAME_PREFIX: usize = 100;

/// Numbered alternatives tried before giving up on a name.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// How long a failed receiver keeps reading after its verdict, so the
/// sender sees the verdict instead of a reset.
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// A header that passed validation.
#[derive(Debug)]
pub(crate) struct Accepted {
    pub file_name: String,
    pub size: u64,
    pub chunk_size: u32,
    pub seed: [u8; SEED_LEN],
}

/// Check a header against local policy.
pub(crate) fn validate(
    header: &TransferHeader,
    settings: &TransferSettings,
) -> Result<Accepted, RejectReason> {
    if !settings.accept_incoming {
        return Err(RejectReason::Declined);
    }
    let file_name =
        sanitize_file_name(&header.file_name).map_err(|_| RejectReason::MalformedHeader)?;
    if header.chunk_size == 0 || header.chunk_size > MAX_CHUNK_SIZE {
        return Err(RejectReason::MalformedHeader);
    }
    let seed = header
        .seed_bytes()
        .map_err(|_| RejectReason::MalformedHeader)?;
    if header.message.as_ref().is_some_and(|m| m.len() > MAX_MESSAGE_LEN) {
        return Err(RejectReason::MalformedHeader);
    }
    if header.size > settings.max_file_bytes || header.chunk_count() > u64::from(u32::MAX) {
        return Err(RejectReason::TooLarge);
    }
    Ok(Accepted {
        file_name,
        size: header.size,
        chunk_size: header.chunk_size,
        seed,
    })
}

/// Run the receiver protocol. Returns the path of the completed file.
pub(crate) async fn receive_file<S>(
    stream: &mut S,
    key: &SharedKey,
    settings: &TransferSettings,
    handle: &mut SessionHandle,
) -> Result<PathBuf, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let accepted = handshake(stream, settings, handle).await?;

    match receive_body(stream, &accepted, key, settings, handle).await {
        Ok(path) => {
            if let Err(e) = deadline(
                settings.handshake_timeout,
                "outcome",
                frame::write_outcome(stream, Outcome::Ok),
            )
            .await
            {
                tracing::debug!(session = %handle.id(), error = %e, "could not confirm completion");
            }
            Ok(path)
        }
        Err(e) => {
            if let Some(outcome) = e.outcome() {
                report_failure(stream, settings, outcome).await;
            }
            Err(e)
        }
    }
}

/// Send a failure verdict, close our side, and discard whatever the sender
/// still has in flight until it hangs up.
///
/// Closing with unread data would reset the connection and could destroy
/// the verdict before the sender reads it.
async fn report_failure<S>(stream: &mut S, settings: &TransferSettings, outcome: Outcome)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sent = deadline(
        settings.handshake_timeout,
        "outcome",
        frame::write_outcome(stream, outcome),
    )
    .await;
    if sent.is_err() {
        return;
    }
    let _ = stream.shutdown().await;
    let _ = tokio::time::timeout(DRAIN_LIMIT, drain(stream)).await;
}

async fn drain<R: AsyncRead + Unpin>(r: &mut R) {
    let mut sink = [0u8; 8192];
    while let Ok(n) = r.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
}

/// Read and judge the header, answering accept or reject.
async fn handshake<S>(
    stream: &mut S,
    settings: &TransferSettings,
    handle: &mut SessionHandle,
) -> Result<Accepted, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let incoming = match deadline(
        settings.handshake_timeout,
        "handshake",
        frame::read_header(stream),
    )
    .await
    {
        Ok(h) => h,
        Err(e @ TransferError::Wire(_)) => {
            reject(stream, settings, RejectReason::MalformedHeader).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let header = match incoming {
        IncomingHeader::Header(h) => h,
        IncomingHeader::UnsupportedVersion(v) => {
            tracing::debug!(session = %handle.id(), version = v, "unsupported protocol version");
            reject(stream, settings, RejectReason::UnsupportedVersion).await;
            return Err(TransferError::Rejected(RejectReason::UnsupportedVersion));
        }
    };

    let shown = sanitize_file_name(&header.file_name).unwrap_or_else(|_| header.file_name.clone());
    let message = header.message.clone().filter(|m| m.len() <= MAX_MESSAGE_LEN);
    handle.describe(&shown, header.size, message.clone());

    let accepted = match validate(&header, settings) {
        Ok(a) => a,
        Err(reason) => {
            reject(stream, settings, reason).await;
            return Err(TransferError::Rejected(reason));
        }
    };

    if let Err(e) = fs::create_dir_all(&settings.receive_dir).await {
        reject(stream, settings, RejectReason::Declined).await;
        return Err(TransferError::file(&settings.receive_dir, e));
    }

    deadline(
        settings.handshake_timeout,
        "handshake",
        frame::write_reply(stream, HandshakeReply::accept()),
    )
    .await?;
    handle.transition(TransferState::Transferring);

    if let Some(m) = &message {
        tracing::info!(session = %handle.id(), peer = %handle.snapshot().peer, message = %m, "transfer message");
    }
    tracing::debug!(
        session = %handle.id(),
        file = %accepted.file_name,
        size = accepted.size,
        "handshake accepted"
    );
    Ok(accepted)
}

/// Best-effort reject reply; the session fails either way.
async fn reject<S: AsyncWrite + Unpin>(
    stream: &mut S,
    settings: &TransferSettings,
    reason: RejectReason,
) {
    let _ = deadline(
        settings.handshake_timeout,
        "reject",
        frame::write_reply(stream, HandshakeReply::reject(reason)),
    )
    .await;
}

async fn receive_body<S>(
    stream: &mut S,
    accepted: &Accepted,
    key: &SharedKey,
    settings: &TransferSettings,
    handle: &mut SessionHandle,
) -> Result<PathBuf, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stem: String = accepted.file_name.chars().take(PART_NAME_PREFIX).collect();
    let part_path = settings
        .receive_dir
        .join(format!(".{stem}.{}.part", handle.id().0));
    let guard = PartialFile::new(part_path.clone());
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&part_path)
        .await
        .map_err(|e| TransferError::file(&part_path, e))?;
    let mut out = BufWriter::new(file);

    let size = accepted.size;
    let mut cipher = ChunkCipher::new(key, &accepted.seed, size)?;
    let mut hasher = Hasher::new();
    let mut buf = Vec::with_capacity(accepted.chunk_size as usize);
    let mut received: u64 = 0;

    let (chunks, total, digest) = loop {
        match deadline(settings.stall_timeout, "frame read", frame::read_frame(stream)).await? {
            StreamFrame::Chunk { index, len } => {
                if len == 0 || len > accepted.chunk_size {
                    return Err(TransferError::Protocol(format!(
                        "chunk {index} has invalid length {len}"
                    )));
                }
                if received + u64::from(len) > size {
                    return Err(TransferError::SizeMismatch {
                        declared: size,
                        received: received + u64::from(len),
                    });
                }
                let tag = deadline(
                    settings.stall_timeout,
                    "chunk read",
                    frame::read_chunk_body(stream, len as usize, &mut buf),
                )
                .await?;
                cipher.open_next(index, &mut buf, &tag)?;

                out.write_all(&buf)
                    .await
                    .map_err(|e| TransferError::file(&part_path, e))?;
                hasher.update(&buf);
                received += u64::from(len);
                handle.advance(u64::from(len));
                tracing::trace!(session = %handle.id(), chunk = index, bytes = len, "chunk verified");
            }
            StreamFrame::End {
                chunks,
                total,
                digest,
            } => break (chunks, total, digest),
        }
    };

    if total != size || received != size {
        return Err(TransferError::SizeMismatch {
            declared: size,
            received,
        });
    }
    if u64::from(chunks) != cipher.next_index() {
        return Err(TransferError::Protocol(format!(
            "end marker counts {chunks} chunks, received {}",
            cipher.next_index()
        )));
    }
    if digest != hasher.finalize() {
        return Err(TransferError::DigestMismatch);
    }

    out.flush()
        .await
        .map_err(|e| TransferError::file(&part_path, e))?;
    let file = out.into_inner();
    file.sync_all()
        .await
        .map_err(|e| TransferError::file(&part_path, e))?;
    drop(file);

    let dest = publish(&part_path, &settings.receive_dir, &accepted.file_name)
        .await
        .map_err(|e| TransferError::file(&settings.receive_dir, e))?;
    guard.commit();
    tracing::info!(session = %handle.id(), path = %dest.display(), bytes = size, "file received");
    Ok(dest)
}

/// `name`, then `stem (1).ext`, `stem (2).ext`, …
fn candidate_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    };
    format!("{stem} ({n}){ext}")
}

/// Move a finished partial file to the first free name in `dir`.
///
/// Hard links make the claim atomic, so concurrent receives of the same
/// name never overwrite each other or an existing file. Filesystems
/// without hard links fall back to an exists-check and rename.
async fn publish(part: &Path, dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    for n in 0..MAX_NAME_ATTEMPTS {
        let dest = dir.join(candidate_name(name, n));
        match fs::hard_link(part, &dest).await {
            Ok(()) => {
                fs::remove_file(part).await?;
                return Ok(dest);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(_) => {
                if !fs::try_exists(&dest).await.unwrap_or(true) {
                    fs::rename(part, &dest).await?;
                    return Ok(dest);
                }
            }
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free file name for {name}"),
    ))
}

/// Deletes the partial file on drop unless committed.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove partial file");
                }
            }
        }
    }
}
