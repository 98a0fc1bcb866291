use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use meshpulse_services::{ErrorKind, Event, TransferState};

use crate::*;

const MIB: usize = 1024 * 1024;

/// 10 MiB end to end: identical bytes, progress never goes backwards and
/// ends exactly at the file size.
#[tokio::test]
async fn ten_mebibytes_arrive_identical() {
    let a = TestNode::start("lan-secret").await;
    let b = TestNode::start("lan-secret").await;

    let contents = pattern(10 * MIB);
    let src = write_file(a.dir.path(), "big.bin", &contents);

    let mut a_events = a.engine.subscribe();
    let mut b_events = b.engine.subscribe();
    let id = a.engine.send_to(b.addr, "b", &src).unwrap();

    let mut seen = Vec::new();
    let sent = tokio::time::timeout(WAIT, async {
        loop {
            match a_events.recv().await.unwrap() {
                Event::TransferProgress { session, bytes, total } if session == id => {
                    assert_eq!(total, contents.len() as u64);
                    seen.push(bytes);
                }
                event => {
                    if let Some(s) = event.terminal() {
                        if s.id == id {
                            return s.clone();
                        }
                    }
                }
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(sent.state, TransferState::Complete, "{:?}", sent.error);
    assert_eq!(sent.bytes, contents.len() as u64);
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards");
    assert_eq!(*seen.last().unwrap(), contents.len() as u64);

    let received = next_terminal(&mut b_events).await;
    assert_eq!(received.state, TransferState::Complete);
    assert_eq!(received.file_name, "big.bin");
    assert_eq!(b.received(), vec!["big.bin".to_string()]);
    assert!(std::fs::read(b.receive_dir().join("big.bin")).unwrap() == contents);
}

#[tokio::test]
async fn note_travels_with_the_file() {
    let a = TestNode::start("lan-secret").await;
    let b = TestNode::start("lan-secret").await;

    // Announce a under a name so the registry path is used.
    let b_disc = b.discovery("bee", "127.0.0.1:9".parse().unwrap());
    let a_disc = a.discovery("ay", b_disc.local_addr().unwrap());
    a_disc.announce_once().await;
    let b_listen = {
        let d = b_disc.clone();
        let rx = b.shutdown_signal();
        tokio::spawn(async move { d.listen_loop(rx).await })
    };
    eventually(|| b.registry.resolve("ay").is_some()).await;

    // b now knows a; send from b to a by display name.
    let src = write_file(b.dir.path(), "notes.txt", b"see attached");
    let mut a_events = a.engine.subscribe();
    let mut b_events = b.engine.subscribe();
    let id = b
        .engine
        .send_with_message("ay", &src, Some("quarterly numbers".into()))
        .unwrap();
    let sent = terminal_of(&mut b_events, id).await;
    assert_eq!(sent.state, TransferState::Complete, "{:?}", sent.error);

    let received = next_terminal(&mut a_events).await;
    assert_eq!(received.state, TransferState::Complete);
    assert_eq!(received.message.as_deref(), Some("quarterly numbers"));
    assert_eq!(
        std::fs::read(a.receive_dir().join("notes.txt")).unwrap(),
        b"see attached"
    );
    b_listen.abort();
}

#[tokio::test]
async fn wrong_secret_fails_integrity_and_leaves_nothing() {
    let a = TestNode::start("alpha").await;
    let b = TestNode::start("bravo").await;
    let src = write_file(a.dir.path(), "secret.bin", &pattern(300 * 1024));

    let mut b_events = b.engine.subscribe();
    let mut a_events = a.engine.subscribe();
    let id = a.engine.send_to(b.addr, "b", &src).unwrap();

    let received = next_terminal(&mut b_events).await;
    assert_eq!(received.state, TransferState::Failed);
    assert_eq!(received.error_kind, Some(ErrorKind::Integrity));
    assert!(b.received().is_empty(), "left behind {:?}", b.received());

    let sent = terminal_of(&mut a_events, id).await;
    assert_eq!(sent.state, TransferState::Failed);
    assert_eq!(sent.error_kind, Some(ErrorKind::Integrity), "{:?}", sent.error);
}

/// Forward one connection to `target`, cutting both sides once `limit`
/// bytes have gone upstream.
async fn cutting_proxy(target: SocketAddr, limit: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.unwrap();
        let mut server = TcpStream::connect(target).await.unwrap();
        let (mut cr, mut cw) = client.split();
        let (mut sr, mut sw) = server.split();

        let upstream = async {
            let mut buf = vec![0u8; 16 * 1024];
            let mut forwarded = 0;
            while forwarded < limit {
                let n = match cr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n.min(limit - forwarded),
                };
                if sw.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                forwarded += n;
            }
        };
        let downstream = async {
            let _ = tokio::io::copy(&mut sr, &mut cw).await;
        };
        tokio::select! {
            _ = upstream => {}
            _ = downstream => {}
        }
    });
    addr
}

#[tokio::test]
async fn dropped_connection_fails_and_retry_succeeds() {
    let a = TestNode::start("lan-secret").await;
    let b = TestNode::start("lan-secret").await;
    let contents = pattern(10 * MIB);
    let src = write_file(a.dir.path(), "flaky.bin", &contents);

    let proxy = cutting_proxy(b.addr, 4 * MIB).await;
    let mut a_events = a.engine.subscribe();
    let mut b_events = b.engine.subscribe();

    let id = a.engine.send_to(proxy, "b", &src).unwrap();
    let sent = terminal_of(&mut a_events, id).await;
    assert_eq!(sent.state, TransferState::Failed);
    assert_eq!(sent.error_kind, Some(ErrorKind::Connection), "{:?}", sent.error);

    let received = next_terminal(&mut b_events).await;
    assert_eq!(received.state, TransferState::Failed);
    assert_eq!(received.error_kind, Some(ErrorKind::Connection));
    assert!(b.received().is_empty(), "left behind {:?}", b.received());

    // Retrying is just a new session.
    let retry = a.engine.send_to(b.addr, "b", &src).unwrap();
    assert_ne!(retry, id);
    let sent = terminal_of(&mut a_events, retry).await;
    assert_eq!(sent.state, TransferState::Complete, "{:?}", sent.error);
    assert!(std::fs::read(b.receive_dir().join("flaky.bin")).unwrap() == contents);
}
