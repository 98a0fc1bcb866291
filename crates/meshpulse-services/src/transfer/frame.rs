//! Async framing for the transfer stream.
//!
//! Thin wrappers that move the wire structs from `meshpulse_core::wire`
//! over any `AsyncRead`/`AsyncWrite`. Deadlines are applied by callers
//! with `deadline`, so the same helpers serve both handshake and stream
//! phases.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};

use meshpulse_core::wire::{
    ChunkFrameHeader, EndFrame, HandshakeReply, HeaderPrelude, Outcome, OutcomeFrame,
    RejectReason, TransferHeader, WireError, FRAME_CHUNK, FRAME_END, FRAME_OUTCOME,
    HEADER_MAX_SIZE, PROTOCOL_VERSION, REPLY_ACCEPT, REPLY_REJECT, STREAM_MAGIC, TAG_LEN,
};

use super::error::{io_to_transfer, TransferError};

const PRELUDE_SIZE: usize = std::mem::size_of::<HeaderPrelude>();
const CHUNK_HEADER_SIZE: usize = std::mem::size_of::<ChunkFrameHeader>();
const END_SIZE: usize = std::mem::size_of::<EndFrame>();
const OUTCOME_SIZE: usize = std::mem::size_of::<OutcomeFrame>();

/// Run `fut` with a deadline, naming the step in the timeout error.
pub async fn deadline<T>(
    limit: Duration,
    step: &'static str,
    fut: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, TransferError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(TransferError::Timeout(step)),
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// What the receiver found at the start of a stream.
#[derive(Debug)]
pub enum IncomingHeader {
    Header(TransferHeader),
    /// The prelude named a version this build does not speak.
    UnsupportedVersion(u8),
}

pub async fn write_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    header: &TransferHeader,
) -> Result<(), TransferError> {
    let body = serde_json::to_vec(header).map_err(|e| WireError::Json(e.to_string()))?;
    if body.len() > HEADER_MAX_SIZE {
        return Err(WireError::TooLarge(body.len()).into());
    }
    let prelude = HeaderPrelude::new(body.len());
    w.write_all(prelude.as_bytes()).await.map_err(io_to_transfer)?;
    w.write_all(&body).await.map_err(io_to_transfer)?;
    w.flush().await.map_err(io_to_transfer)
}

/// Write a prelude claiming `version` followed by `body` verbatim.
#[cfg(test)]
pub(crate) async fn write_raw_prelude<W: AsyncWrite + Unpin>(
    w: &mut W,
    version: u8,
    body: &[u8],
) -> Result<(), TransferError> {
    let mut prelude = HeaderPrelude::new(body.len());
    prelude.version = version;
    w.write_all(prelude.as_bytes()).await.map_err(io_to_transfer)?;
    w.write_all(body).await.map_err(io_to_transfer)?;
    w.flush().await.map_err(io_to_transfer)
}

/// Read a prelude and its JSON body.
///
/// The body is always drained before the version is judged, so a reject
/// reply is never interleaved with unread header bytes.
pub async fn read_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<IncomingHeader, TransferError> {
    let mut raw = [0u8; PRELUDE_SIZE];
    r.read_exact(&mut raw).await.map_err(io_to_transfer)?;
    let prelude = HeaderPrelude::read_from(&raw[..]).ok_or(WireError::BadMagic)?;
    if prelude.magic != STREAM_MAGIC {
        return Err(WireError::BadMagic.into());
    }
    let len = prelude.body_len.get() as usize;
    if len > HEADER_MAX_SIZE {
        return Err(WireError::TooLarge(len).into());
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await.map_err(io_to_transfer)?;

    if prelude.version != PROTOCOL_VERSION {
        return Ok(IncomingHeader::UnsupportedVersion(prelude.version));
    }
    let header = serde_json::from_slice(&body).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(IncomingHeader::Header(header))
}

pub async fn write_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    reply: HandshakeReply,
) -> Result<(), TransferError> {
    w.write_all(reply.as_bytes()).await.map_err(io_to_transfer)?;
    w.flush().await.map_err(io_to_transfer)
}

/// Read the responder's answer. A reject becomes `Rejected`.
pub async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), TransferError> {
    let mut raw = [0u8; 2];
    r.read_exact(&mut raw).await.map_err(io_to_transfer)?;
    let reply = HandshakeReply::read_from(&raw[..]).ok_or(WireError::InvalidField("reply"))?;
    match reply.status {
        REPLY_ACCEPT => Ok(()),
        REPLY_REJECT => Err(TransferError::Rejected(RejectReason::try_from(reply.reason)?)),
        other => Err(WireError::UnknownCode(other).into()),
    }
}

// ── Stream ────────────────────────────────────────────────────────────────────

/// Post-handshake frame header as read off the stream.
#[derive(Debug)]
pub enum StreamFrame {
    /// `len` ciphertext bytes and a tag follow.
    Chunk { index: u32, len: u32 },
    End { chunks: u32, total: u64, digest: [u8; 32] },
}

pub async fn write_chunk<W: AsyncWrite + Unpin>(
    w: &mut W,
    index: u32,
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<(), TransferError> {
    let header = ChunkFrameHeader::new(index, ciphertext.len());
    w.write_all(header.as_bytes()).await.map_err(io_to_transfer)?;
    w.write_all(ciphertext).await.map_err(io_to_transfer)?;
    w.write_all(tag).await.map_err(io_to_transfer)
}

pub async fn write_end<W: AsyncWrite + Unpin>(
    w: &mut W,
    chunks: u32,
    total: u64,
    digest: [u8; 32],
) -> Result<(), TransferError> {
    let end = EndFrame::new(chunks, total, digest);
    w.write_all(end.as_bytes()).await.map_err(io_to_transfer)?;
    w.flush().await.map_err(io_to_transfer)
}

/// Read the next chunk header or end marker.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<StreamFrame, TransferError> {
    let kind = r.read_u8().await.map_err(io_to_transfer)?;
    match kind {
        FRAME_CHUNK => {
            let mut raw = [0u8; CHUNK_HEADER_SIZE];
            raw[0] = kind;
            r.read_exact(&mut raw[1..]).await.map_err(io_to_transfer)?;
            let h = ChunkFrameHeader::read_from(&raw[..]).ok_or(WireError::InvalidField("chunk"))?;
            Ok(StreamFrame::Chunk {
                index: h.index.get(),
                len: h.len.get(),
            })
        }
        FRAME_END => {
            let mut raw = [0u8; END_SIZE];
            raw[0] = kind;
            r.read_exact(&mut raw[1..]).await.map_err(io_to_transfer)?;
            let end = EndFrame::read_from(&raw[..]).ok_or(WireError::InvalidField("end"))?;
            Ok(StreamFrame::End {
                chunks: end.chunks.get(),
                total: end.total.get(),
                digest: end.digest,
            })
        }
        other => Err(WireError::UnknownCode(other).into()),
    }
}

/// Read a chunk body of `len` bytes into `buf` and return its tag.
pub async fn read_chunk_body<R: AsyncRead + Unpin>(
    r: &mut R,
    len: usize,
    buf: &mut Vec<u8>,
) -> Result<[u8; TAG_LEN], TransferError> {
    buf.resize(len, 0);
    r.read_exact(buf).await.map_err(io_to_transfer)?;
    let mut tag = [0u8; TAG_LEN];
    r.read_exact(&mut tag).await.map_err(io_to_transfer)?;
    Ok(tag)
}

// ── Outcome ───────────────────────────────────────────────────────────────────

pub async fn write_outcome<W: AsyncWrite + Unpin>(
    w: &mut W,
    outcome: Outcome,
) -> Result<(), TransferError> {
    w.write_all(OutcomeFrame::new(outcome).as_bytes())
        .await
        .map_err(io_to_transfer)?;
    w.flush().await.map_err(io_to_transfer)
}

pub async fn read_outcome<R: AsyncRead + Unpin>(r: &mut R) -> Result<Outcome, TransferError> {
    let mut raw = [0u8; OUTCOME_SIZE];
    r.read_exact(&mut raw).await.map_err(io_to_transfer)?;
    let frame = OutcomeFrame::read_from(&raw[..]).ok_or(WireError::InvalidField("outcome"))?;
    if frame.kind != FRAME_OUTCOME {
        return Err(WireError::UnknownCode(frame.kind).into());
    }
    Ok(Outcome::try_from(frame.status)?)
}
