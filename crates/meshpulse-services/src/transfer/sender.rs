//! Sending side of one transfer: header, chunk stream, end marker, verdict.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;

use meshpulse_core::crypto::{generate_seed, ChunkCipher, Hasher, SharedKey};
use meshpulse_core::wire::{Outcome, TransferHeader, CHUNK_SIZE};

use super::engine::TransferSettings;
use super::error::TransferError;
use super::frame::{self, deadline};
use super::session::{cancel_requested, Flow, SessionHandle, TransferState};

/// What the sender is about to stream.
pub(crate) struct Outgoing<'a> {
    pub path: &'a Path,
    pub file_name: String,
    pub size: u64,
    pub message: Option<String>,
}

/// Run the sender protocol over an established connection.
///
/// Reads at most `size` bytes from `file`, one chunk at a time. The
/// receiver's verdict is watched for while streaming, so a receiver that
/// gives up early is reported with its own reason. Cancellation is honoured
/// until the end marker has been written.
pub(crate) async fn send_file<S, F>(
    stream: &mut S,
    file: &mut F,
    outgoing: Outgoing<'_>,
    key: &SharedKey,
    settings: &TransferSettings,
    handle: &mut SessionHandle,
    cancel: watch::Receiver<bool>,
) -> Result<Flow, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: AsyncRead + Unpin,
{
    let size = outgoing.size;
    if size.div_ceil(CHUNK_SIZE as u64) > u64::from(u32::MAX) {
        return Err(TransferError::NonceExhausted);
    }
    let path = outgoing.path;

    let seed = generate_seed();
    let header = TransferHeader {
        file_name: outgoing.file_name,
        size,
        chunk_size: CHUNK_SIZE as u32,
        seed: hex::encode(seed),
        message: outgoing.message,
    };

    let cancelled = cancel_requested(cancel);
    tokio::pin!(cancelled);

    let handshake = deadline(settings.handshake_timeout, "handshake", async {
        frame::write_header(stream, &header).await?;
        frame::read_reply(stream).await
    });
    tokio::select! {
        biased;
        r = handshake => r?,
        _ = &mut cancelled => return Ok(Flow::Cancelled),
    }
    handle.transition(TransferState::Transferring);
    tracing::debug!(session = %handle.id(), file = %header.file_name, size, "handshake accepted");

    let (mut rd, mut wr) = tokio::io::split(stream);
    let verdict = frame::read_outcome(&mut rd);
    tokio::pin!(verdict);

    let streamed = async {
        let mut cipher = ChunkCipher::new(key, &seed, size)?;
        let mut hasher = Hasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = size;

        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let n = fill(file, &mut buf[..want])
                .await
                .map_err(|e| TransferError::file(path, e))?;
            if n < want {
                return Err(TransferError::file(
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "file shrank during transfer",
                    ),
                ));
            }

            hasher.update(&buf[..n]);
            let (index, tag) = cipher.seal_next(&mut buf[..n])?;
            deadline(
                settings.stall_timeout,
                "chunk write",
                frame::write_chunk(&mut wr, index, &buf[..n], &tag),
            )
            .await?;

            remaining -= n as u64;
            handle.advance(n as u64);
            tracing::trace!(session = %handle.id(), chunk = index, bytes = n, "chunk sent");
        }

        let chunks = cipher.next_index() as u32;
        deadline(
            settings.stall_timeout,
            "end marker",
            frame::write_end(&mut wr, chunks, size, hasher.finalize()),
        )
        .await
    };
    tokio::pin!(streamed);

    tokio::select! {
        biased;
        early = &mut verdict => return Err(premature(early)),
        r = &mut streamed => r?,
        _ = &mut cancelled => return Ok(Flow::Cancelled),
    }

    match deadline(settings.stall_timeout, "outcome", verdict).await? {
        Outcome::Ok => Ok(Flow::Done(None)),
        other => Err(TransferError::Remote(other)),
    }
}

/// A verdict that arrived before the end marker was written.
fn premature(verdict: Result<Outcome, TransferError>) -> TransferError {
    match verdict {
        Ok(Outcome::Ok) => {
            TransferError::Protocol("receiver confirmed before the end marker".into())
        }
        Ok(other) => TransferError::Remote(other),
        Err(e) => e,
    }
}

/// Read until `buf` is full or the source is exhausted.
async fn fill<F: AsyncRead + Unpin>(file: &mut F, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
