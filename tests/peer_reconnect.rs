//! Peer recovery when its relay goes away.

use parley_core::{DownloadStore, PortSpec};
use parley_integration_tests::{TestPeer, TestRelay, WAIT, peer_config};
use parley_peer::{FixedName, Peer, PeerConfig, PeerError, PeerEvent, Phase};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_reconnects_to_restarted_relay() {
    let relay = TestRelay::start().await;
    let addr = relay.addr();
    let dir = tempfile::tempdir().unwrap();

    let mut ana = TestPeer::join_relay(&relay, "ana", dir.path()).await;
    ana.wait_for_status("Connected to").await;

    relay.shutdown().await;
    ana.wait_for_status("Connection lost").await;

    let relay = TestRelay::start_on(addr).await;
    let line = ana.wait_for_status("Connected to").await;
    assert_eq!(line, format!("Connected to {} as ana", addr));
    relay.wait_for_names(&["ana"]).await;
    assert_eq!(ana.peer.phase().await, Phase::Listening);

    // The new session carries traffic.
    relay.handle.announce_text("back").await.unwrap();
    assert_eq!(
        ana.next_message().await,
        ("Servidor".to_string(), "back".to_string())
    );

    relay.shutdown().await;
}

#[tokio::test]
async fn test_fails_over_to_next_candidate() {
    let primary = TestRelay::start().await;
    let backup = TestRelay::start().await;
    let dir = tempfile::tempdir().unwrap();

    let config = peer_config(PortSpec::List(vec![primary.port(), backup.port()]));
    let mut ana = TestPeer::join(config, "ana", dir.path()).await;
    let line = ana.wait_for_status("Connected to").await;
    assert!(line.ends_with(&format!(":{} as ana", primary.port())));
    primary.wait_for_names(&["ana"]).await;

    primary.shutdown().await;
    ana.wait_for_status("Connection lost").await;
    let line = ana.wait_for_status("Connected to").await;
    assert!(line.ends_with(&format!(":{} as ana", backup.port())));
    backup.wait_for_names(&["ana"]).await;

    backup.shutdown().await;
}

#[tokio::test]
async fn test_manual_disconnect_does_not_reconnect() {
    let relay = TestRelay::start().await;
    let dir = tempfile::tempdir().unwrap();

    let mut ana = TestPeer::join_relay(&relay, "ana", dir.path()).await;
    relay.wait_for_names(&["ana"]).await;

    ana.peer.disconnect().await;
    ana.wait_for_status("Disconnected").await;
    relay.wait_for_names(&[]).await;

    // Nothing dials back in while the relay stays up.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(relay.handle.names().is_empty());
    assert_eq!(ana.peer.phase().await, Phase::Disconnected);
    while let Ok(event) = ana.events.try_recv() {
        assert!(
            !matches!(&event, PeerEvent::Status(line) if line.starts_with("Connected to")),
            "unexpected reconnect: {event:?}"
        );
    }

    // An explicit connect works again.
    ana.peer.connect().await.unwrap();
    relay.wait_for_names(&["ana"]).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_then_connect_keeps_one_session() {
    let relay = TestRelay::start().await;
    let dir = tempfile::tempdir().unwrap();

    let mut ana = TestPeer::join_relay(&relay, "ana", dir.path()).await;
    relay.wait_for_names(&["ana"]).await;

    // Reconnect right away, before the old listener has wound down.
    ana.peer.disconnect().await;
    ana.peer.connect().await.unwrap();

    // Give a stale listener time to dial in a second time. The relay may
    // still hold the old session briefly, so the new one can be `ana(1)`.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let deadline = tokio::time::Instant::now() + WAIT;
    while relay.handle.names().len() != 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "relay holds {:?}",
            relay.handle.names()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ana.peer.phase().await, Phase::Listening);

    let mut connected = 0;
    while let Ok(event) = ana.events.try_recv() {
        if matches!(&event, PeerEvent::Status(line) if line.starts_with("Connected to")) {
            connected += 1;
        }
    }
    // One for the join, one for the explicit connect.
    assert_eq!(connected, 2);
    assert_eq!(relay.handle.names().len(), 1);

    // The one session carries traffic.
    relay.handle.announce_text("still here").await.unwrap();
    assert_eq!(
        ana.next_message().await,
        ("Servidor".to_string(), "still here".to_string())
    );

    relay.shutdown().await;
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    // Bind then release a port so nothing is listening on it.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let dir = tempfile::tempdir().unwrap();

    let config = PeerConfig {
        max_attempts: 3,
        retry_delay: Duration::from_millis(20),
        ..peer_config(PortSpec::single(port))
    };
    let store = DownloadStore::new(dir.path(), "recv_");
    let (peer, mut events) = Peer::tcp(config, Arc::new(FixedName::new("ana")), store).unwrap();

    let err = peer.connect().await.unwrap_err();
    assert!(matches!(err, PeerError::Exhausted { attempts: 3 }));
    assert_eq!(peer.phase().await, Phase::Disconnected);

    let mut statuses = Vec::new();
    while let Ok(PeerEvent::Status(line)) = events.try_recv() {
        statuses.push(line);
    }
    assert_eq!(
        statuses.last().map(String::as_str),
        Some("Could not connect to 127.0.0.1 after 3 attempts")
    );
}
