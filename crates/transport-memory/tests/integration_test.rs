//! Integration tests for the memory transport and server

use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use sowlink_message::{AckStatus, AckTypes, CommandKind, Message};
use sowlink_transport::{ConnectionEpoch, Transport, TransportError, TransportEvent};
use sowlink_transport_memory::{MemoryServer, MemoryTransport, SERVER_VERSION};
use tokio::time::timeout;
use tracing_test::traced_test;

async fn next_event(events: &mut BoxStream<'static, TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(5), events.next())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

async fn next_message(events: &mut BoxStream<'static, TransportEvent>) -> Message {
    loop {
        if let TransportEvent::Message(_, message) = next_event(events).await {
            return message;
        }
    }
}

fn logon(client: &str) -> Message {
    let mut message = Message::new(CommandKind::Logon).with_command_id("logon-1");
    message.client_name = Some(client.to_string());
    message.ack_type = AckTypes::PROCESSED;
    message
}

#[tokio::test]
#[traced_test]
async fn test_logon_ack_reports_version_and_sequence() {
    let server = MemoryServer::new();
    server.set_last_persisted("client-a", 7);
    let transport = MemoryTransport::new(&server);
    let mut events = transport.incoming().unwrap();
    assert!(transport.incoming().is_none());

    let epoch = transport.connect().await.unwrap();
    assert_eq!(epoch, ConnectionEpoch::new(1));
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected(e) if e == epoch
    ));

    transport.send(&logon("client-a")).await.unwrap();
    let ack = next_message(&mut events).await;
    assert_eq!(ack.command, CommandKind::Ack);
    assert_eq!(ack.status, Some(AckStatus::Success));
    assert_eq!(ack.sequence, Some(7));
    assert_eq!(ack.version.as_deref(), Some(SERVER_VERSION));
}

#[tokio::test]
#[traced_test]
async fn test_dropped_connection_emits_disconnect_and_reconnect_advances_epoch() {
    let server = MemoryServer::new();
    let transport = MemoryTransport::new(&server);
    let mut events = transport.incoming().unwrap();

    let first = transport.connect().await.unwrap();
    let _ = next_event(&mut events).await;

    server.drop_connections();
    match next_event(&mut events).await {
        TransportEvent::Disconnected(epoch, _) => assert_eq!(epoch, first),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        transport.send(&logon("c")).await,
        Err(TransportError::NotConnected | TransportError::Disconnected { .. })
    ));

    let second = transport.reconnect(first).await.unwrap();
    assert!(second > first);
    // A late reconnect for the old epoch converges on the live connection.
    assert_eq!(transport.reconnect(first).await.unwrap(), second);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_refused_connection_fails() {
    let server = MemoryServer::new();
    server.set_accepting(false);
    let transport = MemoryTransport::new(&server);
    assert!(matches!(
        transport.connect().await,
        Err(TransportError::ConnectionFailed(_))
    ));
    assert_eq!(transport.epoch(), None);
}

#[tokio::test]
#[traced_test]
async fn test_one_publish_carries_every_matching_subscription() {
    let server = MemoryServer::new();
    let transport = MemoryTransport::new(&server);
    let mut events = transport.incoming().unwrap();
    transport.connect().await.unwrap();
    transport.send(&logon("c")).await.unwrap();
    let _ = next_message(&mut events).await;

    for sub in ["s1", "s2"] {
        let subscribe = Message::new(CommandKind::Subscribe)
            .with_topic("orders")
            .with_sub_id(sub);
        transport.send(&subscribe).await.unwrap();
    }
    server.seed("orders", "k1", "{\"id\":1}");

    let delivered = next_message(&mut events).await;
    assert_eq!(delivered.command, CommandKind::Publish);
    assert_eq!(delivered.sub_ids, vec!["s1".into(), "s2".into()]);
    assert_eq!(delivered.bookmark.as_deref(), Some("1|1|"));
}

#[tokio::test]
#[traced_test]
async fn test_shutdown_ends_incoming_stream() {
    let server = MemoryServer::new();
    let transport = MemoryTransport::new(&server);
    let mut events = transport.incoming().unwrap();
    transport.connect().await.unwrap();
    transport.shutdown().await.unwrap();

    let mut saw_disconnect = false;
    while let Some(event) = timeout(Duration::from_secs(5), events.next()).await.unwrap() {
        saw_disconnect |= matches!(event, TransportEvent::Disconnected(..));
    }
    assert!(saw_disconnect);
    assert!(matches!(
        transport.connect().await,
        Err(TransportError::Shutdown)
    ));
}
