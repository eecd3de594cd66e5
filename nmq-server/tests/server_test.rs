//! End-to-end tests: a real listener driven by the nmq client, plus in-memory
//! duplex streams attached directly to the server.

use nmq_client::{ClientConfig, ClientError, Connection};
use nmq_protocol::{ping_frame, OpCode};
use nmq_server::{
    ChannelHandler, ConnectionEvent, Registry, Server, ServerConfig, ServerError, ServerState,
};
use nmq_snowflake::{SnowId, SnowNode};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    server: Server,
    addr: SocketAddr,
    events: UnboundedReceiver<ConnectionEvent>,
}

async fn start_server(config: ServerConfig) -> Harness {
    let (handler, events) = ChannelHandler::new();
    let server = Server::new(
        config,
        Arc::new(Registry::new()),
        Arc::new(SnowNode::new(7).unwrap()),
        Arc::new(handler),
    );
    let addr = server.start().await.unwrap();
    Harness {
        server,
        addr,
        events,
    }
}

fn local_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().unwrap())
}

async fn connect(addr: SocketAddr) -> Connection {
    let config = ClientConfig::new(addr).with_read_timeout(WAIT);
    Connection::connect(config).await.unwrap()
}

async fn next_event(events: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn expect_connected(events: &mut UnboundedReceiver<ConnectionEvent>) -> SnowId {
    match next_event(events).await {
        ConnectionEvent::Connected { id, .. } => id,
        other => panic!("expected Connected, got {:?}", other),
    }
}

async fn expect_disconnected(events: &mut UnboundedReceiver<ConnectionEvent>) -> SnowId {
    match next_event(events).await {
        ConnectionEvent::Disconnected { id } => id,
        other => panic!("expected Disconnected, got {:?}", other),
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_connect_and_receive_message() {
    let mut h = start_server(local_config()).await;
    let client = connect(h.addr).await;

    let conn_id = expect_connected(&mut h.events).await;
    assert_eq!(h.server.registry().len(), 1);
    assert!(h.server.registry().lookup(conn_id).is_some());

    client.send_binary(b"hello").await.unwrap();

    match next_event(&mut h.events).await {
        ConnectionEvent::Message {
            id,
            opcode,
            message,
        } => {
            assert_eq!(id, conn_id);
            assert_eq!(opcode, OpCode::Binary);
            assert_eq!(message.data.as_ref(), b"hello");
            let message_id = SnowId::parse_str(&message.id).unwrap();
            assert!(message_id > conn_id);
        }
        other => panic!("expected Message, got {:?}", other),
    }

    assert_eq!(h.server.stats().messages_total.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_text_message() {
    let mut h = start_server(local_config()).await;
    let client = connect(h.addr).await;
    expect_connected(&mut h.events).await;

    client.send_text("héllo").await.unwrap();
    match next_event(&mut h.events).await {
        ConnectionEvent::Message {
            opcode, message, ..
        } => {
            assert_eq!(opcode, OpCode::Text);
            assert_eq!(message.data.as_ref(), "héllo".as_bytes());
        }
        other => panic!("expected Message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let mut h = start_server(local_config()).await;
    let client = connect(h.addr).await;
    expect_connected(&mut h.events).await;

    client.ping(b"are you there").await.unwrap();
    let frame = client.recv_frame().await.unwrap().unwrap();
    assert_eq!(frame.opcode(), OpCode::Pong);
    assert_eq!(frame.payload.as_ref(), b"are you there");
    // server frames are never masked
    assert!(frame.header.mask.is_none());
}

#[tokio::test]
async fn test_client_close_handshake() {
    let mut h = start_server(local_config()).await;
    let client = connect(h.addr).await;
    let conn_id = expect_connected(&mut h.events).await;

    client.close().await.unwrap();

    assert_eq!(expect_disconnected(&mut h.events).await, conn_id);
    assert!(h.server.registry().is_empty());
    assert_eq!(
        h.server
            .stats()
            .connections_active
            .load(Ordering::Relaxed),
        0
    );
}

#[tokio::test]
async fn test_fragmented_message() {
    let mut h = start_server(local_config()).await;
    let client = connect(h.addr).await;
    expect_connected(&mut h.events).await;

    client
        .send_fragments(OpCode::Text, &[b"frag", b"mented ", b"message"])
        .await
        .unwrap();
    // a ping between messages is answered without disturbing assembly
    client.ping(b"p").await.unwrap();

    match next_event(&mut h.events).await {
        ConnectionEvent::Message {
            opcode, message, ..
        } => {
            assert_eq!(opcode, OpCode::Text);
            assert_eq!(message.data.as_ref(), b"fragmented message");
        }
        other => panic!("expected Message, got {:?}", other),
    }
    let pong = client.recv_frame().await.unwrap().unwrap();
    assert_eq!(pong.opcode(), OpCode::Pong);
}

#[tokio::test]
async fn test_large_message() {
    let mut h = start_server(local_config()).await;
    let client = connect(h.addr).await;
    expect_connected(&mut h.events).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    client.send_binary(&payload).await.unwrap();

    match next_event(&mut h.events).await {
        ConnectionEvent::Message { message, .. } => {
            assert_eq!(message.len(), 200_000);
            assert_eq!(message.data.as_ref(), payload.as_slice());
        }
        other => panic!("expected Message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_send_to_connection() {
    let mut h = start_server(local_config()).await;
    let client = connect(h.addr).await;
    let conn_id = expect_connected(&mut h.events).await;

    h.server
        .send(conn_id, OpCode::Binary, b"pushed")
        .await
        .unwrap();

    let frame = client.recv_frame().await.unwrap().unwrap();
    assert_eq!(frame.opcode(), OpCode::Binary);
    assert_eq!(frame.payload.as_ref(), b"pushed");
}

#[tokio::test]
async fn test_close_connection_from_server() {
    let mut h = start_server(local_config()).await;
    let client = connect(h.addr).await;
    let conn_id = expect_connected(&mut h.events).await;

    h.server.close_connection(conn_id).unwrap();

    assert!(client.recv_frame().await.unwrap().is_none());
    assert_eq!(expect_disconnected(&mut h.events).await, conn_id);
    assert!(matches!(
        h.server.close_connection(conn_id),
        Err(ServerError::ConnectionNotFound(_))
    ));
    assert!(matches!(
        h.server.send(conn_id, OpCode::Binary, b"x").await,
        Err(ServerError::ConnectionNotFound(_))
    ));
}

#[tokio::test]
async fn test_protocol_error_closes_only_that_connection() {
    let mut h = start_server(local_config()).await;
    let bad = connect(h.addr).await;
    let bad_id = expect_connected(&mut h.events).await;
    let good = connect(h.addr).await;
    let good_id = expect_connected(&mut h.events).await;

    // reserved opcode 0x3
    bad.send_raw(&[0x83, 0x00]).await.unwrap();

    let close = bad.recv_frame().await.unwrap().unwrap();
    assert_eq!(close.opcode(), OpCode::Close);
    assert_eq!(close.payload.as_ref(), &1002u16.to_be_bytes());
    assert!(bad.recv_frame().await.unwrap().is_none());
    assert_eq!(expect_disconnected(&mut h.events).await, bad_id);

    good.send_binary(b"still here").await.unwrap();
    match next_event(&mut h.events).await {
        ConnectionEvent::Message { id, message, .. } => {
            assert_eq!(id, good_id);
            assert_eq!(message.data.as_ref(), b"still here");
        }
        other => panic!("expected Message, got {:?}", other),
    }
    assert_eq!(h.server.registry().ids(), vec![good_id]);
    assert_eq!(h.server.stats().protocol_errors.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_stop_drains_registry() {
    let mut h = start_server(local_config()).await;
    let a = connect(h.addr).await;
    let b = connect(h.addr).await;
    let id_a = expect_connected(&mut h.events).await;
    let id_b = expect_connected(&mut h.events).await;
    assert_ne!(id_a, id_b);
    assert_eq!(h.server.registry().len(), 2);

    h.server.stop().unwrap();
    tokio::time::timeout(WAIT, h.server.join())
        .await
        .unwrap()
        .unwrap();

    assert!(h.server.registry().is_empty());
    assert_eq!(h.server.state(), ServerState::Stopped);
    assert!(a.recv_frame().await.unwrap().is_none());
    assert!(b.recv_frame().await.unwrap().is_none());

    let mut gone = vec![
        expect_disconnected(&mut h.events).await,
        expect_disconnected(&mut h.events).await,
    ];
    gone.sort();
    let mut expected = vec![id_a, id_b];
    expected.sort();
    assert_eq!(gone, expected);

    // listener is gone
    let refused = Connection::connect(
        ClientConfig::new(h.addr).with_connect_timeout(Duration::from_secs(1)),
    )
    .await;
    assert!(refused.is_err());
}

/// Attaches a small in-memory stream whose client floods Pings and never
/// reads the Pongs, so the server's replies back up.
async fn attach_non_reading_peer(h: &mut Harness) -> SnowId {
    let (client_side, server_side) = tokio::io::duplex(256);
    let id = h.server.attach(server_side, None).unwrap();
    assert_eq!(expect_connected(&mut h.events).await, id);

    tokio::spawn(flood_pings(client_side));
    // let the server wedge on a Pong
    tokio::time::sleep(Duration::from_millis(300)).await;
    id
}

async fn flood_pings(mut client: DuplexStream) {
    let ping = ping_frame(&[0u8; 100]);
    for _ in 0..200 {
        if client.write_all(&ping).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn test_stop_ends_connection_stuck_writing() {
    let mut h = start_server(local_config()).await;
    let id = attach_non_reading_peer(&mut h).await;

    h.server.stop().unwrap();
    tokio::time::timeout(WAIT, h.server.join())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(expect_disconnected(&mut h.events).await, id);
    assert!(h.server.registry().is_empty());
    let server = &h.server;
    wait_until(|| server.stats().connections_active.load(Ordering::Relaxed) == 0).await;
}

#[tokio::test]
async fn test_close_connection_ends_connection_stuck_writing() {
    let mut h = start_server(local_config()).await;
    let id = attach_non_reading_peer(&mut h).await;

    h.server.close_connection(id).unwrap();

    assert_eq!(expect_disconnected(&mut h.events).await, id);
    assert!(h.server.registry().is_empty());
    assert!(h.server.is_running());
}

#[tokio::test]
async fn test_read_error_tears_down_connection() {
    let mut h = start_server(local_config()).await;

    let stream = tokio_test::io::Builder::new()
        .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
        .build();
    let id = h.server.attach(stream, None).unwrap();

    assert_eq!(expect_connected(&mut h.events).await, id);
    assert_eq!(expect_disconnected(&mut h.events).await, id);
    assert!(h.server.registry().is_empty());
    assert_eq!(h.server.stats().protocol_errors.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_connection_limit() {
    let mut h = start_server(local_config().with_max_connections(1)).await;
    let _first = connect(h.addr).await;
    expect_connected(&mut h.events).await;

    let second = connect(h.addr).await;
    match second.recv_frame().await {
        Ok(None) | Err(ClientError::Io(_)) => {}
        other => panic!(
            "expected the second connection to be dropped, got {:?}",
            other.map(|f| f.map(|f| f.opcode()))
        ),
    }

    let server = &h.server;
    wait_until(|| server.stats().connections_rejected.load(Ordering::Relaxed) == 1).await;
    assert_eq!(server.registry().len(), 1);
}

#[tokio::test]
async fn test_connection_ids_are_unique_and_ordered() {
    let mut h = start_server(local_config()).await;
    let mut clients = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..10 {
        clients.push(connect(h.addr).await);
        ids.push(expect_connected(&mut h.events).await);
    }

    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 10);
    assert_eq!(sorted, ids);
    assert_eq!(h.server.registry().ids(), ids);
}

#[tokio::test]
async fn test_attached_duplex_stream() {
    let mut h = start_server(local_config()).await;

    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let conn_id = h.server.attach(server_side, None).unwrap();
    let client = Connection::from_stream(
        client_side,
        ClientConfig::default().with_read_timeout(WAIT),
    );

    match next_event(&mut h.events).await {
        ConnectionEvent::Connected { id, peer } => {
            assert_eq!(id, conn_id);
            assert!(peer.is_none());
        }
        other => panic!("expected Connected, got {:?}", other),
    }

    client.send_binary(b"in memory").await.unwrap();
    match next_event(&mut h.events).await {
        ConnectionEvent::Message { id, message, .. } => {
            assert_eq!(id, conn_id);
            assert_eq!(message.data.as_ref(), b"in memory");
        }
        other => panic!("expected Message, got {:?}", other),
    }

    client.ping(b"").await.unwrap();
    let pong = client.recv_frame().await.unwrap().unwrap();
    assert_eq!(pong.opcode(), OpCode::Pong);

    client.close().await.unwrap();
    assert_eq!(expect_disconnected(&mut h.events).await, conn_id);
    assert!(h.server.registry().is_empty());
}

#[tokio::test]
async fn test_client_eof_unregisters() {
    let mut h = start_server(local_config()).await;
    let client = connect(h.addr).await;
    let conn_id = expect_connected(&mut h.events).await;

    drop(client);

    assert_eq!(expect_disconnected(&mut h.events).await, conn_id);
    assert!(h.server.registry().lookup(conn_id).is_none());
}
