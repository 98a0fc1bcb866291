use tokio::sync::broadcast;

use meshpulse_services::{Event, Liveness, TransferState};

use crate::*;

async fn next_peer_event(rx: &mut broadcast::Receiver<Event>) -> Event {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(e @ (Event::PeerAdded(_) | Event::PeerUpdated(_) | Event::PeerRemoved(_))) => {
                    return e
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a peer event")
}

/// A announces to B; B learns A, sends to it by name, then forgets A once
/// the beacons stop.
#[tokio::test]
async fn beacons_drive_the_peer_lifecycle() {
    let a = TestNode::start("lan-secret").await;
    let b = TestNode::start("lan-secret").await;

    let b_disc = b.discovery("bee", "127.0.0.1:9".parse().unwrap());
    let a_disc = a.discovery("ay", b_disc.local_addr().unwrap());
    let a_id = a_disc.identity().peer_id.clone();

    let mut b_events = b.engine.subscribe();
    let listen = {
        let d = b_disc.clone();
        let rx = b.shutdown_signal();
        tokio::spawn(async move { d.listen_loop(rx).await })
    };
    let sweep = {
        let d = b_disc.clone();
        let rx = b.shutdown_signal();
        tokio::spawn(async move { d.sweep_loop(rx).await })
    };
    let announcer = {
        let d = a_disc.clone();
        let rx = a.shutdown_signal();
        tokio::spawn(async move { d.announce_loop(rx).await })
    };

    let Event::PeerAdded(peer) = next_peer_event(&mut b_events).await else {
        panic!("first peer event should be an add");
    };
    assert_eq!(peer.id, a_id);
    assert_eq!(peer.name, "ay");
    assert_eq!(peer.addr, a.addr, "transfer address comes from the beacon");
    assert_eq!(peer.status, Liveness::Alive);

    // Display names resolve for sending.
    let src = write_file(b.dir.path(), "hello.txt", b"hello, ay");
    let mut sends = b.engine.subscribe();
    let id = b.engine.send("ay", &src).unwrap();
    let done = terminal_of(&mut sends, id).await;
    assert_eq!(done.state, TransferState::Complete, "{:?}", done.error);
    assert_eq!(done.peer, a_id);
    assert_eq!(
        std::fs::read(a.receive_dir().join("hello.txt")).unwrap(),
        b"hello, ay"
    );

    // Silence: stale first, then gone.
    announcer.abort();
    let removed = tokio::time::timeout(WAIT, async {
        let mut saw_stale = false;
        loop {
            match next_peer_event(&mut b_events).await {
                Event::PeerUpdated(p) if p.status == Liveness::Stale => saw_stale = true,
                Event::PeerRemoved(p) => return (saw_stale, p),
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(removed.0, "peer went straight from alive to removed");
    assert_eq!(removed.1.id, a_id);
    assert!(b.registry.get(&a_id).is_none());
    assert!(matches!(
        b.engine.send("ay", &src),
        Err(meshpulse_services::TransferError::UnknownPeer(_))
    ));

    // A single beacon brings it back.
    a_disc.announce_once().await;
    eventually(|| b.registry.get(&a_id).is_some()).await;

    listen.abort();
    sweep.abort();
}
