//! Shared fixtures for session integration tests.

#![allow(dead_code)]

use std::time::Duration;

use sowlink_message::Message;
use sowlink_session::{ReconnectConfig, ResultStream, Session, SessionConfig, StreamItem};
use sowlink_transport_memory::{MemoryServer, MemoryTransport};

pub const CLIENT: &str = "test-client";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Config with short timeouts and fast reconnects.
pub fn config() -> SessionConfig {
    SessionConfig::new(CLIENT)
        .with_default_timeout(Duration::from_secs(2))
        .with_logon_timeout(Duration::from_secs(2))
        .with_reconnect(ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: 0,
        })
}

pub fn session(server: &MemoryServer) -> Session<MemoryTransport> {
    Session::builder(MemoryTransport::new(server))
        .with_config(config())
        .build()
}

pub async fn connected(server: &MemoryServer) -> Session<MemoryTransport> {
    let session = session(server);
    session.connect().await.unwrap();
    session
}

/// Poll `condition` until it holds, failing the test after `timeout`.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next message on `stream`, failing the test if none arrives.
pub async fn next_message(stream: &mut ResultStream) -> Message {
    match stream.next_timeout(Duration::from_secs(2)).await {
        StreamItem::Message(message) => message,
        other => panic!("expected a message, got {other:?}"),
    }
}
