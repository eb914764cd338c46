//! Integration tests for TCP transport

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use sowlink_message::{AckStatus, AckTypes, CommandKind, Message, codec};
use sowlink_transport::{Config, Transport, TransportError, TransportEvent};
use sowlink_transport_tcp::{TcpConfig, TcpTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing_test::traced_test;

async fn read_frame(stream: &mut TcpStream) -> Message {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let mut data = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut data).await.unwrap();
    codec::decode(&data).unwrap()
}

async fn write_frame(stream: &mut TcpStream, message: &Message) {
    let data: Bytes = codec::encode(message).unwrap();
    stream
        .write_all(&(data.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&data).await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_tcp_round_trip_and_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_frame(&mut stream).await;
        assert_eq!(request.command, CommandKind::Flush);
        let ack = Message::ack(
            request.command_id.clone().unwrap(),
            AckTypes::PROCESSED,
            AckStatus::Success,
        );
        write_frame(&mut stream, &ack).await;
        // Dropping the stream closes the connection.
    });

    let transport = TcpTransport::new(TcpConfig::new(address));
    let mut events = transport.incoming().unwrap();
    let epoch = transport.connect().await.unwrap();
    assert!(matches!(
        events.next().await,
        Some(TransportEvent::Connected(e)) if e == epoch
    ));

    let flush = Message::new(CommandKind::Flush).with_command_id("f1");
    assert_eq!(transport.send(&flush).await.unwrap(), epoch);

    let event = timeout(Duration::from_secs(5), events.next()).await.unwrap();
    match event {
        Some(TransportEvent::Message(e, ack)) => {
            assert_eq!(e, epoch);
            assert_eq!(ack.command, CommandKind::Ack);
            assert_eq!(ack.command_id, Some("f1".into()));
        }
        other => panic!("unexpected event {other:?}"),
    }

    server.await.unwrap();
    let event = timeout(Duration::from_secs(5), events.next()).await.unwrap();
    assert!(matches!(event, Some(TransportEvent::Disconnected(e, _)) if e == epoch));
    assert_eq!(transport.epoch(), None);
}

#[tokio::test]
#[traced_test]
async fn test_connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let transport = TcpTransport::new(TcpConfig::new(address));
    assert!(matches!(
        transport.connect().await,
        Err(TransportError::ConnectionFailed(_) | TransportError::Timeout(_))
    ));
    assert!(matches!(
        transport.send(&Message::new(CommandKind::Heartbeat)).await,
        Err(TransportError::NotConnected)
    ));
}

#[tokio::test]
#[traced_test]
async fn test_oversized_frame_is_rejected_before_sending() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _conn = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut config = TcpConfig::new(address);
    config.transport = Config {
        max_frame_size: 64,
        ..Config::default()
    };
    let transport = TcpTransport::new(config);
    transport.connect().await.unwrap();

    let big = Message::new(CommandKind::Publish)
        .with_topic("orders")
        .with_data(vec![b'x'; 256]);
    assert!(matches!(
        transport.send(&big).await,
        Err(TransportError::FrameTooLarge { max: 64, .. })
    ));
    transport.shutdown().await.unwrap();
}
