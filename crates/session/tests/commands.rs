//! Commands, streams and handlers on a healthy connection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use sowlink_message::{AckReason, AckTypes, Command, CommandKind, Identifier, Message};
use sowlink_session::{Error, HandlerError, Session, StreamItem, StreamOptions, StreamState};
use sowlink_transport_memory::{MemoryServer, MemoryTransport};

use common::{config, connected, eventually, init_logging, next_message};

async fn drain(stream: &mut sowlink_session::ResultStream) -> Vec<Message> {
    let mut messages = Vec::new();
    loop {
        match stream.next_timeout(Duration::from_secs(2)).await {
            StreamItem::Message(message) => messages.push(message),
            StreamItem::End => return messages,
            StreamItem::NoDataYet => panic!("stream stalled after {} messages", messages.len()),
        }
    }
}

#[tokio::test]
async fn test_query_ends_after_its_group() {
    init_logging();
    let server = MemoryServer::new();
    server.seed("orders", "1", r#"{"color":"blue"}"#);
    server.seed("orders", "2", r#"{"color":"red"}"#);
    server.seed("orders", "3", r#"{"color":"blue","size":2}"#);
    let session = connected(&server).await;

    let mut stream = session.sow("orders", Some("blue")).await.unwrap();
    let keys: Vec<_> = drain(&mut stream)
        .await
        .into_iter()
        .filter(|message| message.command == CommandKind::Sow)
        .filter_map(|message| message.sow_key)
        .collect();

    assert_eq!(keys, vec!["1".to_string(), "3".to_string()]);
    assert_eq!(stream.state(), StreamState::Closed);
    eventually(Duration::from_secs(2), || session.route_count() == 0).await;
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_sow_delete_reports_deleted_records() {
    init_logging();
    let server = MemoryServer::new();
    server.seed("orders", "1", r#"{"color":"blue"}"#);
    server.seed("orders", "2", r#"{"color":"red"}"#);
    server.seed("orders", "3", r#"{"color":"green"}"#);
    let session = connected(&server).await;

    let ack = session.sow_delete("orders", "blue").await.unwrap();
    assert_eq!(ack.records.deleted, 1);
    let ack = session.sow_delete_by_keys("orders", "2").await.unwrap();
    assert_eq!(ack.records.deleted, 1);
    assert_eq!(server.cached("orders").len(), 1);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_requested_acks_end_an_ack_stream() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;

    let mut stream = session
        .execute(Command::publish("orders", "x").add_ack_type(AckTypes::PROCESSED))
        .await
        .unwrap();
    let acks = drain(&mut stream).await;

    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack_type, AckTypes::PROCESSED);
    assert_eq!(stream.command_id(), acks[0].command_id.as_ref());
    eventually(Duration::from_secs(2), || session.route_count() == 0).await;
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_command_without_acks_returns_a_closed_stream() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;

    let mut stream = session.execute(Command::publish("orders", "x")).await.unwrap();
    assert_eq!(stream.next_timeout(Duration::from_millis(10)).await, StreamItem::End);
    assert_eq!(session.route_count(), 0);
    assert_eq!(server.received_publishes().len(), 1);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_subscription_ids_are_exclusive_unless_replaced() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;

    let _first = session
        .execute(Command::subscribe("orders").with_sub_id("s1"))
        .await
        .unwrap();
    let err = session
        .execute(Command::subscribe("orders").with_sub_id("s1"))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::SubscriptionExists(id) if *id == Identifier::from("s1")),
        "{err:?}"
    );

    let replacement = session
        .execute(
            Command::subscribe("orders")
                .with_sub_id("s1")
                .with_options("replace"),
        )
        .await
        .unwrap();
    assert_eq!(replacement.id(), Some(&Identifier::from("s1")));
    assert_eq!(session.route_count(), 1);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_replace_leaves_newer_subscription_routed() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;
    let replace = |timeout| {
        Command::subscribe("orders")
            .with_sub_id("s1")
            .with_options("replace")
            .with_timeout(timeout)
    };
    let _original = session
        .execute(Command::subscribe("orders").with_sub_id("s1"))
        .await
        .unwrap();

    server.hold_subscribe_acks(true);
    let stalled = session.clone();
    let failed = tokio::spawn(async move {
        stalled
            .execute(replace(Duration::from_millis(200)))
            .await
            .map(|_| ())
    });
    eventually(Duration::from_secs(2), || {
        server.received_of(CommandKind::Subscribe).len() == 2
    })
    .await;

    server.hold_subscribe_acks(false);
    let mut current = session.execute(replace(Duration::from_secs(2))).await.unwrap();
    let err = failed.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::TimedOut(_)), "{err:?}");
    assert_eq!(session.route_count(), 1);

    server.seed("orders", "1", "live");
    assert_eq!(next_message(&mut current).await.data_str(), "live");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_dropping_a_stream_unsubscribes() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;

    let stream = session.subscribe("orders").await.unwrap();
    assert_eq!(server.subscription_count(), 1);
    drop(stream);

    eventually(Duration::from_secs(2), || server.subscription_count() == 0).await;
    assert_eq!(session.route_count(), 0);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_all_clears_every_subscription() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;

    let _orders = session.subscribe("orders").await.unwrap();
    let _trades = session.subscribe("trades").await.unwrap();
    session
        .subscribe_with("quotes", |_: &Message| Ok::<(), HandlerError>(()))
        .await
        .unwrap();
    assert_eq!(server.subscription_count(), 3);

    session.unsubscribe_all().await.unwrap();
    eventually(Duration::from_secs(2), || server.subscription_count() == 0).await;
    assert_eq!(session.route_count(), 0);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_conflated_stream_keeps_latest_per_record() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;

    let mut stream = session
        .execute_with(Command::subscribe("prices"), StreamOptions::default().conflated())
        .await
        .unwrap();
    assert_eq!(stream.state(), StreamState::Conflating);
    for price in ["1", "2", "3"] {
        server.seed("prices", "AAPL", price);
    }
    server.seed("prices", "MSFT", "9");
    eventually(Duration::from_secs(2), || stream.depth() == 2).await;

    let first = next_message(&mut stream).await;
    assert_eq!(first.sow_key.as_deref(), Some("AAPL"));
    assert_eq!(first.data_str(), "3");
    assert_eq!(next_message(&mut stream).await.data_str(), "9");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_full_stream_stalls_instead_of_dropping() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;

    let mut stream = session
        .execute_with(Command::subscribe("ticks"), StreamOptions::default().with_capacity(2))
        .await
        .unwrap();
    for n in 0..6 {
        server.seed("ticks", &n.to_string(), &n.to_string());
    }

    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(next_message(&mut stream).await.data_str().into_owned());
    }
    assert_eq!(seen, vec!["0", "1", "2", "3", "4", "5"]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_not_entitled_rejection_offers_a_corrected_retry() {
    init_logging();
    let server = MemoryServer::new();
    server.require_user_id("secure");
    let session = Session::builder(MemoryTransport::new(&server))
        .with_config(config().with_user_id("ops"))
        .build();
    session.connect().await.unwrap();

    let err = session
        .publish_sync(Command::publish("secure", "x"))
        .await
        .unwrap_err();
    let retry = match err {
        Error::ServerFailure {
            reason: AckReason::NotEntitled,
            retry: Some(retry),
            ..
        } => retry,
        other => panic!("expected a not-entitled rejection, got {other:?}"),
    };
    assert_eq!(retry.message().user_id.as_deref(), Some("ops"));

    let receipt = session.publish_sync(*retry).await.unwrap();
    assert!(!receipt.is_queued());
    assert_eq!(server.cached("secure").len(), 1);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_unclaimed_messages_reach_the_last_chance_handler() {
    init_logging();
    let server = MemoryServer::new();
    let unclaimed = Arc::new(Mutex::new(Vec::new()));
    let sink = unclaimed.clone();
    let session = Session::builder(MemoryTransport::new(&server))
        .with_config(config())
        .with_last_chance_handler(move |message: &Message| {
            sink.lock().push(message.clone());
            Ok::<(), HandlerError>(())
        })
        .build();
    session.connect().await.unwrap();

    server.inject(
        &Message::new(CommandKind::Publish)
            .with_topic("orders")
            .with_sub_id("nobody")
            .with_data("orphan"),
    );
    eventually(Duration::from_secs(2), || !unclaimed.lock().is_empty()).await;
    assert_eq!(unclaimed.lock()[0].data_str(), "orphan");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_failures_reach_the_exception_listener() {
    init_logging();
    let server = MemoryServer::new();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let session = Session::builder(MemoryTransport::new(&server))
        .with_config(config())
        .with_exception_listener(move |error: &HandlerError, _: &Message| {
            sink.lock().push(error.clone());
        })
        .build();
    session.connect().await.unwrap();

    session
        .subscribe_with("orders", |message: &Message| -> Result<(), HandlerError> {
            if message.data_str() == "panic" {
                panic!("handler blew up");
            }
            Err(HandlerError::Failed("rejected".to_string()))
        })
        .await
        .unwrap();
    server.seed("orders", "1", "fail");
    server.seed("orders", "2", "panic");
    server.seed("orders", "3", "still delivered");

    eventually(Duration::from_secs(2), || failures.lock().len() == 3).await;
    let failures = failures.lock().clone();
    assert_eq!(failures[0], HandlerError::Failed("rejected".to_string()));
    assert!(matches!(&failures[1], HandlerError::Panicked(text) if text.contains("blew up")));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_flush_waits_for_the_server() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;

    session.publish("orders", "x").await.unwrap();
    session.flush(Duration::from_secs(1)).await.unwrap();
    assert_eq!(server.received_of(CommandKind::Flush).len(), 1);

    server.set_silent(true);
    let err = session.flush(Duration::from_millis(30)).await.unwrap_err();
    assert!(matches!(err, Error::TimedOut(_)), "{err:?}");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_commands_are_usage_errors() {
    init_logging();
    let server = MemoryServer::new();
    let session = connected(&server).await;

    let err = session.execute(Command::new(CommandKind::Subscribe)).await.unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "{err:?}");
    let err = session
        .publish_sync(Command::subscribe("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "{err:?}");
    session.close().await.unwrap();
}
