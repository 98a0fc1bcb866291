use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use zerocopy::AsBytes;

use meshpulse_core::crypto::{generate_seed, ChunkCipher, SharedKey};
use meshpulse_core::wire::{
    HandshakeReply, HeaderPrelude, RejectReason, TransferHeader, CHUNK_SIZE, PROTOCOL_VERSION,
};
use meshpulse_services::transfer::frame::{self, IncomingHeader};
use meshpulse_services::{Direction, ErrorKind, TransferError, TransferState};

use crate::*;

/// A receiver that accepts the handshake and then stops reading until
/// `resume` fires. It then reads to the end of the stream.
struct StallingReceiver {
    addr: std::net::SocketAddr,
    resume: oneshot::Sender<()>,
    drained: JoinHandle<std::io::Result<usize>>,
}

async fn stalling_receiver() -> StallingReceiver {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (resume, resumed) = oneshot::channel();
    let drained = tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.unwrap();
        let IncomingHeader::Header(_) = frame::read_header(&mut s).await.unwrap() else {
            panic!("expected a current-version header");
        };
        frame::write_reply(&mut s, HandshakeReply::accept()).await.unwrap();
        let _ = resumed.await;
        let mut sink = Vec::new();
        s.read_to_end(&mut sink).await
    });
    StallingReceiver {
        addr,
        resume,
        drained,
    }
}

/// Write a stream header prelude claiming `version`, then `body`.
async fn write_prelude(s: &mut TcpStream, version: u8, body: &[u8]) {
    let mut prelude = HeaderPrelude::new(body.len());
    prelude.version = version;
    s.write_all(prelude.as_bytes()).await.unwrap();
    s.write_all(body).await.unwrap();
    s.flush().await.unwrap();
}

#[tokio::test]
async fn cancel_mid_transfer_ends_cancelled() {
    let a = TestNode::start("lan-secret").await;
    let src = write_file(a.dir.path(), "huge.bin", &pattern(32 * 1024 * 1024));
    let staller = stalling_receiver().await;

    let mut events = a.engine.subscribe();
    let id = a.engine.send_to(staller.addr, "staller", &src).unwrap();

    let engine = a.engine.clone();
    eventually(move || {
        engine
            .session(id)
            .is_some_and(|s| s.state == TransferState::Transferring && s.bytes > 0)
    })
    .await;

    assert!(a.engine.cancel(id));
    let done = terminal_of(&mut events, id).await;
    assert_eq!(done.state, TransferState::Cancelled);
    assert!(done.error.is_none());
    assert!(done.bytes < done.total);

    // A finished session cannot be cancelled again.
    assert!(!a.engine.cancel(id));

    // The sender hung up: the receiver reaches a clean end of stream.
    staller.resume.send(()).unwrap();
    let drained = tokio::time::timeout(WAIT, staller.drained)
        .await
        .expect("sender kept the connection open after cancelling")
        .unwrap();
    assert!(drained.is_ok(), "{drained:?}");
}

#[tokio::test]
async fn cancel_on_the_receiving_side_ends_cancelled() {
    let b = TestNode::start("lan-secret").await;
    let key = SharedKey::derive("lan-secret").unwrap();
    let mut events = b.engine.subscribe();

    // Hand-driven sender: one valid chunk of a much larger file, then silence.
    let size = 1024 * 1024;
    let seed = generate_seed();
    let mut s = TcpStream::connect(b.addr).await.unwrap();
    let header = TransferHeader {
        file_name: "slow.bin".into(),
        size,
        chunk_size: CHUNK_SIZE as u32,
        seed: hex::encode(seed),
        message: None,
    };
    frame::write_header(&mut s, &header).await.unwrap();
    frame::read_reply(&mut s).await.unwrap();
    let mut cipher = ChunkCipher::new(&key, &seed, size).unwrap();
    let mut chunk = pattern(CHUNK_SIZE);
    let (index, tag) = cipher.seal_next(&mut chunk).unwrap();
    frame::write_chunk(&mut s, index, &chunk, &tag).await.unwrap();

    eventually(|| {
        b.engine
            .sessions()
            .iter()
            .any(|t| t.state == TransferState::Transferring && t.bytes > 0)
    })
    .await;
    let id = b.engine.sessions()[0].id;
    assert!(b.engine.cancel(id));

    let done = terminal_of(&mut events, id).await;
    assert_eq!(done.state, TransferState::Cancelled);
    assert_eq!(done.direction, Direction::Receive);
    assert!(done.error.is_none());
    assert!(b.received().is_empty(), "left behind {:?}", b.received());

    // The receiver hangs up without a verdict.
    let mut rest = Vec::new();
    let ended = tokio::time::timeout(WAIT, s.read_to_end(&mut rest))
        .await
        .expect("receiver kept the connection open after cancelling");
    assert!(rest.is_empty() || ended.is_err(), "unexpected bytes {rest:?}");
}

#[tokio::test]
async fn receiver_rejects_other_protocol_versions() {
    let b = TestNode::start("lan-secret").await;
    let mut events = b.engine.subscribe();

    let mut s = TcpStream::connect(b.addr).await.unwrap();
    write_prelude(&mut s, PROTOCOL_VERSION + 1, b"{\"future\":true}").await;
    let reply = frame::read_reply(&mut s).await;
    assert!(
        matches!(reply, Err(TransferError::Rejected(RejectReason::UnsupportedVersion))),
        "{reply:?}"
    );

    let failed = next_terminal(&mut events).await;
    assert_eq!(failed.state, TransferState::Failed);
    assert_eq!(failed.error_kind, Some(ErrorKind::Protocol));
    assert!(b.received().is_empty());
}

#[tokio::test]
async fn sender_reports_a_version_reject() {
    let a = TestNode::start("lan-secret").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.unwrap();
        let _ = frame::read_header(&mut s).await;
        let reply = HandshakeReply::reject(RejectReason::UnsupportedVersion);
        frame::write_reply(&mut s, reply).await.unwrap();
    });

    let src = write_file(a.dir.path(), "v.bin", b"versioned");
    let mut events = a.engine.subscribe();
    let id = a.engine.send_to(target, "old-node", &src).unwrap();
    let done = terminal_of(&mut events, id).await;
    assert_eq!(done.state, TransferState::Failed);
    assert_eq!(done.error_kind, Some(ErrorKind::Protocol));
    assert!(done
        .error
        .as_deref()
        .is_some_and(|e| e.contains("unsupported protocol version")));
}

#[tokio::test]
async fn declined_and_oversized_transfers_are_rejected() {
    let a = TestNode::start("lan-secret").await;
    let closed = TestNode::start_with("lan-secret", |s| s.accept_incoming = false).await;
    let small = TestNode::start_with("lan-secret", |s| s.max_file_bytes = 1024).await;
    let src = write_file(a.dir.path(), "two-k.bin", &pattern(2048));
    let mut events = a.engine.subscribe();

    let id = a.engine.send_to(closed.addr, "closed", &src).unwrap();
    let done = terminal_of(&mut events, id).await;
    assert_eq!(done.state, TransferState::Failed);
    assert!(done.error.as_deref().is_some_and(|e| e.contains("peer declined")));
    assert!(closed.received().is_empty());

    let id = a.engine.send_to(small.addr, "small", &src).unwrap();
    let done = terminal_of(&mut events, id).await;
    assert_eq!(done.state, TransferState::Failed);
    assert!(done.error.as_deref().is_some_and(|e| e.contains("file too large")));
    assert!(small.received().is_empty());
}

#[tokio::test]
async fn unreachable_peer_is_a_connection_failure() {
    let a = TestNode::start_with("lan-secret", |s| {
        s.handshake_timeout = Duration::from_millis(500)
    })
    .await;
    // Bind then drop to get a port nothing listens on.
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let src = write_file(a.dir.path(), "x.bin", b"x");
    let mut events = a.engine.subscribe();
    let id = a.engine.send_to(dead, "ghost", &src).unwrap();
    let done = terminal_of(&mut events, id).await;
    assert_eq!(done.state, TransferState::Failed);
    assert!(matches!(
        done.error_kind,
        Some(ErrorKind::Connection | ErrorKind::Timeout)
    ));
}
