mod common;

use common::{id, Broker};
use hostlink_common::FailureKind;
use hostlink_core::{ConnectionMeta, HandoffConfig, HandoffOutcome, PolicyEntry, PolicySnapshot};
use std::os::fd::AsFd;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn chat_policy() -> PolicySnapshot {
    PolicySnapshot::new(1)
        .with_entry(id("chat"), PolicyEntry::default().resumable("websocket"))
        .with_entry(id("billing"), PolicyEntry::default())
}

/// A live TCP connection: (remote user end, server end held by the app)
async fn live_connection() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let user = TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (user, server)
}

#[tokio::test]
async fn test_connection_survives_handoff() {
    let broker = Broker::new(chat_policy());
    let (mut user, old_server) = live_connection().await;

    let mut old = broker.client("chat");
    let token = old
        .offer_handoff(vec![(
            ConnectionMeta::new("websocket", b"seq=41".to_vec()),
            old_server.as_fd(),
        )])
        .await
        .unwrap();

    let mut old_waiter = broker.client("chat");
    let waiting = {
        let token = token.clone();
        tokio::spawn(async move { old_waiter.await_handoff(&token).await })
    };

    let mut new = broker.client("chat");
    let mut adopted = new.adopt(&token).await.unwrap();
    assert_eq!(adopted.len(), 1);
    let (meta, socket) = adopted.remove(0);
    assert_eq!(meta.class, "websocket");
    assert_eq!(meta.resume_state, b"seq=41");

    assert_eq!(waiting.await.unwrap().unwrap(), HandoffOutcome::Committed);
    drop(old_server);

    let socket = std::net::TcpStream::from(socket);
    socket.set_nonblocking(true).unwrap();
    let mut new_server = TcpStream::from_std(socket).unwrap();

    new_server.write_all(b"seq=42").await.unwrap();
    let mut buf = [0u8; 6];
    user.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"seq=42");

    user.write_all(b"ack").await.unwrap();
    let mut ack = [0u8; 3];
    new_server.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"ack");
}

#[tokio::test]
async fn test_token_is_consumed_once() {
    let broker = Broker::new(chat_policy());
    let (_user, server) = live_connection().await;

    let mut old = broker.client("chat");
    let token = old
        .offer_handoff(vec![(ConnectionMeta::new("websocket", vec![]), server.as_fd())])
        .await
        .unwrap();

    let mut first = broker.client("chat");
    assert_eq!(first.adopt(&token).await.unwrap().len(), 1);

    let mut second = broker.client("chat");
    let err = second.adopt(&token).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::HandoffRejected);
}

#[tokio::test]
async fn test_other_identity_cannot_adopt() {
    let broker = Broker::new(chat_policy());
    let (_user, server) = live_connection().await;

    let mut old = broker.client("chat");
    let token = old
        .offer_handoff(vec![(ConnectionMeta::new("websocket", vec![]), server.as_fd())])
        .await
        .unwrap();

    let mut intruder = broker.client("billing");
    let err = intruder.adopt(&token).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::HandoffRejected);

    // The offer is still there for the rightful successor.
    let mut new = broker.client("chat");
    assert_eq!(new.adopt(&token).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_non_resumable_class_is_rejected() {
    let broker = Broker::new(chat_policy());
    let (_user, server) = live_connection().await;

    let mut old = broker.client("chat");
    let err = old
        .offer_handoff(vec![(ConnectionMeta::new("grpc", vec![]), server.as_fd())])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::HandoffRejected);
    assert!(broker.handoff.pending().await.is_empty());
}

#[tokio::test]
async fn test_expired_offer_is_aborted() {
    let config = HandoffConfig {
        offer_ttl: Duration::from_millis(50),
        ..Default::default()
    };
    let broker = Broker::with_handoff_config(chat_policy(), config);
    let (_user, server) = live_connection().await;

    let mut old = broker.client("chat");
    let token = old
        .offer_handoff(vec![(ConnectionMeta::new("websocket", vec![]), server.as_fd())])
        .await
        .unwrap();

    let waiting = tokio::spawn(async move { old.await_handoff(&token).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.handoff.reap_expired().await, 1);
    assert_eq!(waiting.await.unwrap().unwrap(), HandoffOutcome::Aborted);
}
