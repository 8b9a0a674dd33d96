mod common;

use common::{client_hello, id};
use hostlink_core::sni::alert;
use hostlink_core::{
    Backend, DonationListener, Multiplexor, MultiplexorConfig, Pattern, PolicyEntry,
    PolicyRegistry, PolicySnapshot, RouteTable, RoutingTable, SessionState, SessionTracker,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn shop_policy() -> PolicySnapshot {
    PolicySnapshot::new(1).with_entry(
        id("shop"),
        PolicyEntry::default().allow_inbound(Pattern::Cidr {
            network: "127.0.0.0".parse().unwrap(),
            prefix_len: 8,
        }),
    )
}

/// Starts a multiplexor on an ephemeral port.
async fn start(routes: RouteTable, config: MultiplexorConfig) -> (SocketAddr, Arc<SessionTracker>) {
    let tracker = Arc::new(SessionTracker::new(Duration::from_secs(60)));
    let mux = Arc::new(Multiplexor::new(
        Arc::new(RoutingTable::new(routes)),
        Arc::new(PolicyRegistry::new(shop_policy())),
        tracker.clone(),
        config,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mux.serve(listener));
    (addr, tracker)
}

async fn wait_for_finish(tracker: &SessionTracker) -> SessionState {
    for _ in 0..100 {
        if let Some(info) = tracker.list().await.into_iter().find(|s| s.ended_at.is_some()) {
            return info.state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session never finished");
}

#[tokio::test]
async fn test_local_donation_preserves_bytes_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let backend = DonationListener::bind(dir.path().join("shop.sock")).unwrap();
    let routes = RouteTable::new(1).with_route(
        "shop.example.com",
        Backend::local(id("shop"), backend.path()),
    );
    let (addr, tracker) = start(routes, MultiplexorConfig::default()).await;

    let hello = client_hello("Shop.Example.com");
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&hello).await.unwrap();
    client.write_all(b"application data").await.unwrap();

    let mut donated = backend.accept().await.unwrap();
    assert_eq!(donated.server_name, "shop.example.com");
    assert_eq!(donated.peer_addr, client.local_addr().unwrap());
    assert!(donated.preamble.starts_with(&hello));

    let mut expected = hello.clone();
    expected.extend_from_slice(b"application data");
    let mut received = donated.preamble.clone();
    while received.len() < expected.len() {
        let mut chunk = vec![0u8; expected.len() - received.len()];
        let n = donated.stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received, expected);

    donated.stream.write_all(b"server reply").await.unwrap();
    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"server reply");

    assert_eq!(wait_for_finish(&tracker).await, SessionState::Resolved);
}

#[tokio::test]
async fn test_unrouted_name_delivers_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let backend = DonationListener::bind(dir.path().join("shop.sock")).unwrap();
    let routes = RouteTable::new(1).with_route(
        "shop.example.com",
        Backend::local(id("shop"), backend.path()),
    );
    let (addr, tracker) = start(routes, MultiplexorConfig::default()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&client_hello("other.example.com"))
        .await
        .unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, alert::fatal(alert::UNRECOGNIZED_NAME).to_vec());

    assert!(timeout(Duration::from_millis(200), backend.accept()).await.is_err());
    assert_eq!(wait_for_finish(&tracker).await, SessionState::Rejected);
}

#[tokio::test]
async fn test_incomplete_preamble_times_out() {
    let config = MultiplexorConfig {
        handshake_timeout: Duration::from_millis(150),
        ..Default::default()
    };
    let (addr, tracker) = start(RouteTable::new(1), config).await;

    let hello = client_hello("shop.example.com");
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&hello[..hello.len() / 2]).await.unwrap();

    let mut reply = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_empty());
    assert_eq!(wait_for_finish(&tracker).await, SessionState::TimedOut);
}

#[tokio::test]
async fn test_unavailable_backend_gets_internal_error() {
    let dir = tempfile::tempdir().unwrap();
    let routes = RouteTable::new(1).with_route(
        "shop.example.com",
        Backend::local(id("shop"), dir.path().join("missing.sock")),
    );
    let (addr, tracker) = start(routes, MultiplexorConfig::default()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&client_hello("shop.example.com"))
        .await
        .unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, alert::fatal(alert::INTERNAL_ERROR).to_vec());
    assert_eq!(wait_for_finish(&tracker).await, SessionState::Rejected);
}
