//! End-to-End Synchronization Tests
//!
//! These tests run a real server and real clients over loopback TCP.
//!
//! ## What These Tests Verify
//!
//! - Registration handshake and confirmation
//! - Folder-scoped fan-out: subscribers get the change, the origin and
//!   non-subscribers do not
//! - Malformed or out-of-order first frames never enter the registry
//! - Graceful shutdown broadcasts `ServerShutdown` to everyone
//! - Connection loss is surfaced to the host application

use std::time::Duration;

use foldersync_core::{
    ClientConfig, ClientEvent, ClientIdentity, ConnectionState, FileChangeNotification,
    ServerConfig, SyncClient, SyncMessage, SyncPayload, SyncServer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

async fn start_server() -> (SyncServer, String) {
    let _ = tracing_subscriber::fmt::try_init();
    let server = SyncServer::new(ServerConfig::default());
    let addr = server.start(0).await.unwrap();
    (server, addr.to_string())
}

fn client(id: &str, folders: &[&str]) -> SyncClient {
    let identity = ClientIdentity::new(
        id,
        format!("test {}", id),
        folders.iter().map(|f| f.to_string()),
    );
    SyncClient::new(identity, ClientConfig::default())
}

/// Wait for the next event matching `pred`, failing the test after a
/// few seconds.
async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Connect and wait until the server confirms registration.
async fn connect_confirmed(client: &SyncClient, addr: &str) -> broadcast::Receiver<ClientEvent> {
    let mut events = client.subscribe();
    client.connect(addr).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            ClientEvent::Message(SyncMessage {
                payload: SyncPayload::RegistrationConfirmed { .. },
                ..
            })
        )
    })
    .await;
    assert_eq!(client.state(), ConnectionState::Active);
    events
}

fn is_file_change(event: &ClientEvent) -> bool {
    matches!(
        event,
        ClientEvent::Message(SyncMessage {
            payload: SyncPayload::FileChange { .. },
            ..
        })
    )
}

#[tokio::test]
async fn test_change_reaches_other_subscriber_only() {
    let (server, addr) = start_server().await;

    let c1 = client("c1", &["Reports"]);
    let c2 = client("c2", &["Reports"]);
    let c3 = client("c3", &["Archive"]);
    let mut c1_events = connect_confirmed(&c1, &addr).await;
    let mut c2_events = connect_confirmed(&c2, &addr).await;
    let mut c3_events = connect_confirmed(&c3, &addr).await;

    c1.announce(FileChangeNotification::new(
        "budget.xlsx",
        "Reports",
        "8c2f91",
        "c1",
    ))
    .await
    .unwrap();

    // The other subscriber of "Reports" receives the change.
    let event = wait_for(&mut c2_events, is_file_change).await;
    let ClientEvent::Message(msg) = event else {
        unreachable!()
    };
    let SyncPayload::FileChange { notification } = msg.payload else {
        unreachable!()
    };
    assert_eq!(notification.file_id, "budget.xlsx");
    assert_eq!(notification.content_hash, "8c2f91");
    assert_eq!(notification.source_client_id, "c1");

    // The origin and the non-subscriber stay quiet.
    assert!(
        timeout(QUIET, c1_events.recv()).await.is_err(),
        "origin must not receive its own change"
    );
    assert!(
        timeout(QUIET, c3_events.recv()).await.is_err(),
        "non-subscriber must not be notified"
    );

    c1.disconnect().await;
    c2.disconnect().await;
    c3.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_registration_fills_remote_address() {
    let (server, addr) = start_server().await;

    let c1 = client("c1", &["Reports"]);
    connect_confirmed(&c1, &addr).await;

    let identity = server.registry().identity("c1").unwrap();
    assert!(
        identity.remote_address.is_some(),
        "server should stamp the peer address"
    );

    c1.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_registration_never_enters_registry() {
    let (server, addr) = start_server().await;

    let mut raw = tokio::net::TcpStream::connect(&addr).await.unwrap();
    raw.write_all(b"this is not json\n").await.unwrap();

    // The server drops the connection without registering anything.
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, raw.read(&mut buf))
        .await
        .expect("server should close the connection")
        .unwrap();
    assert_eq!(n, 0, "expected EOF, got {} bytes", n);
    assert!(server.registry().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_first_frame_must_be_a_registration() {
    let (server, addr) = start_server().await;

    let heartbeat = SyncMessage::new(SyncPayload::Heartbeat {});
    let mut raw = tokio::net::TcpStream::connect(&addr).await.unwrap();
    raw.write_all(heartbeat.to_line().unwrap().as_bytes())
        .await
        .unwrap();
    raw.write_all(b"\n").await.unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(WAIT, raw.read(&mut buf))
        .await
        .expect("server should close the connection")
        .unwrap();
    assert_eq!(n, 0);
    assert!(server.registry().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_message_type_is_tolerated() {
    let (server, addr) = start_server().await;

    let c1 = client("c1", &["Reports"]);
    let c2 = client("c2", &["Reports"]);
    connect_confirmed(&c1, &addr).await;
    let mut c2_events = connect_confirmed(&c2, &addr).await;

    // A frame with a type this version has never heard of.
    let future_frame = format!(
        "{{\"type\":\"QuantumSync\",\"messageId\":\"{}\",\"timestamp\":\"{}\",\"payload\":{{}}}}\n",
        uuid::Uuid::new_v4(),
        chrono::Utc::now().to_rfc3339(),
    );
    let mut raw = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let registration = SyncMessage::new(SyncPayload::Registration {
        client_info: ClientIdentity::new("raw", "raw", ["Reports".to_string()]),
    });
    raw.write_all(registration.to_line().unwrap().as_bytes())
        .await
        .unwrap();
    raw.write_all(b"\n").await.unwrap();
    raw.write_all(future_frame.as_bytes()).await.unwrap();

    // The unknown frame is ignored, not fatal: the same connection can
    // still announce a change that reaches subscribers.
    let change = SyncMessage::new(SyncPayload::FileChange {
        notification: FileChangeNotification::new("f1", "Reports", "h1", "raw"),
    });
    raw.write_all(change.to_line().unwrap().as_bytes())
        .await
        .unwrap();
    raw.write_all(b"\n").await.unwrap();

    wait_for(&mut c2_events, is_file_change).await;

    c1.disconnect().await;
    c2.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_stop_broadcasts_shutdown_notice() {
    let (server, addr) = start_server().await;

    let c1 = client("c1", &["Reports"]);
    let mut c1_events = connect_confirmed(&c1, &addr).await;

    server.stop().await;

    wait_for(&mut c1_events, |e| {
        matches!(
            e,
            ClientEvent::Message(SyncMessage {
                payload: SyncPayload::ServerShutdown { .. },
                ..
            })
        )
    })
    .await;
    wait_for(&mut c1_events, |e| matches!(e, ClientEvent::ConnectionLost)).await;
    assert_eq!(c1.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connection_lost_when_server_goes_away() {
    let (server, addr) = start_server().await;

    let c1 = client("c1", &["Reports"]);
    let mut c1_events = connect_confirmed(&c1, &addr).await;
    assert!(c1.heartbeat().await.is_ok());

    server.stop().await;
    wait_for(&mut c1_events, |e| matches!(e, ClientEvent::ConnectionLost)).await;

    // Once the connection is gone, sends fail cleanly.
    c1.disconnect().await;
    assert!(c1.heartbeat().await.is_err());
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let (server, addr) = start_server().await;

    let c1 = client("c1", &["Reports"]);
    connect_confirmed(&c1, &addr).await;
    c1.disconnect().await;
    assert_eq!(c1.state(), ConnectionState::Disconnected);

    // The same client object can connect again.
    connect_confirmed(&c1, &addr).await;
    c1.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_reregistration_survives_old_connection_teardown() {
    let (server, addr) = start_server().await;

    let first = client("c1", &["Reports"]);
    connect_confirmed(&first, &addr).await;

    // Same client ID over a fresh connection while the old one is
    // still open: the new registration replaces the old entry.
    let second = client("c1", &["Reports"]);
    connect_confirmed(&second, &addr).await;

    // The replaced connection winds down in the background; its
    // cleanup must not remove the replacement entry.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(
        server.registry().contains("c1"),
        "replacement registration was removed by the old connection's teardown"
    );

    // The fresh connection still works end to end.
    let c2 = client("c2", &["Reports"]);
    let mut c2_events = connect_confirmed(&c2, &addr).await;
    second
        .announce(FileChangeNotification::new("f1", "Reports", "h1", "c1"))
        .await
        .unwrap();
    wait_for(&mut c2_events, is_file_change).await;

    second.disconnect().await;
    c2.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_heartbeats_refresh_last_seen() {
    let (server, addr) = start_server().await;

    let c1 = client("c1", &["Reports"]);
    connect_confirmed(&c1, &addr).await;
    let before = server.registry().identity("c1").unwrap().last_seen;

    tokio::time::sleep(Duration::from_millis(50)).await;
    c1.heartbeat().await.unwrap();

    timeout(WAIT, async {
        loop {
            let seen = server.registry().identity("c1").unwrap().last_seen;
            if seen > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("heartbeat should refresh last_seen");

    c1.disconnect().await;
    server.stop().await;
}
