#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_domain::{ConnectionId, Identity, UserId};
use parley_protocol::{Envelope, MessageType, Payload, codes, decode};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::server::connection::{ConnectionSettings, run_connection, write_batch};
use crate::server::hub::{Hub, HubConfig, HubHandle};
use crate::server::lifecycle::{ConnState, Lifecycle};
use crate::server::registry::ConnectionHandle;
use crate::server::router::{Router, RouterConfig};
use crate::server::store::Stores;

struct Harness {
	hub: HubHandle,
	client: WebSocketStream<DuplexStream>,
	server: JoinHandle<()>,
}

async fn start(settings: ConnectionSettings) -> Harness {
	let (hub, _task) = Hub::spawn(HubConfig::default());
	start_on(hub, settings, 1).await
}

/// Runs connection 1 (user 1, alice) against an existing hub and waits until it holds `expected` connections.
async fn start_on(hub: HubHandle, settings: ConnectionSettings, expected: usize) -> Harness {
	let router = Router::new(hub.clone(), Stores::in_memory(), RouterConfig::default());

	let (client_io, server_io) = tokio::io::duplex(64 * 1024);
	let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, Some(settings.websocket_config())).await;
	let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

	let server = tokio::spawn(run_connection(
		server_ws,
		ConnectionId(1),
		Identity::new(UserId(1), "alice"),
		router,
		settings,
	));

	// Wait for registration so hub queries see the connection.
	for _ in 0..100 {
		if hub.connection_count().await.unwrap_or(0) == expected {
			break;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}

	Harness { hub, client, server }
}

/// Next text frame from the server, decoded; keepalive pings are skipped.
async fn next_envelope(client: &mut WebSocketStream<DuplexStream>) -> Envelope {
	loop {
		let msg = timeout(Duration::from_secs(2), client.next())
			.await
			.expect("frame within deadline")
			.expect("stream open")
			.expect("valid frame");
		match msg {
			Message::Text(text) => return decode(text.as_str()).expect("server envelope decodes"),
			Message::Ping(_) | Message::Pong(_) => continue,
			other => panic!("unexpected frame {other:?}"),
		}
	}
}

/// Reads until the server closes; returns the close frame if one arrived.
async fn read_until_closed(client: &mut WebSocketStream<DuplexStream>) -> Option<(CloseCode, String)> {
	loop {
		match timeout(Duration::from_secs(2), client.next()).await.expect("close within deadline") {
			Some(Ok(Message::Close(frame))) => return frame.map(|f| (f.code, f.reason.as_str().to_string())),
			Some(Ok(_)) => continue,
			Some(Err(_)) | None => return None,
		}
	}
}

async fn wait_server(server: JoinHandle<()>) {
	timeout(Duration::from_secs(2), server)
		.await
		.expect("connection task finished")
		.expect("connection task did not panic");
}

#[tokio::test]
async fn ping_envelope_gets_pong() {
	let mut h = start(ConnectionSettings::default()).await;

	h.client.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
	assert_eq!(next_envelope(&mut h.client).await.message_type(), MessageType::Pong);
}

#[tokio::test]
async fn protocol_errors_keep_the_connection_open() {
	let mut h = start(ConnectionSettings::default()).await;

	h.client.send(Message::text("not json")).await.unwrap();
	match next_envelope(&mut h.client).await.payload {
		Payload::Error(e) => assert_eq!(e.code, codes::MALFORMED_ENVELOPE),
		other => panic!("expected error, got {other:?}"),
	}

	h.client.send(Message::text(r#"{"type":"shout","payload":{}}"#)).await.unwrap();
	match next_envelope(&mut h.client).await.payload {
		Payload::Error(e) => assert_eq!(e.code, codes::UNKNOWN_TYPE),
		other => panic!("expected error, got {other:?}"),
	}

	h.client.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
	match next_envelope(&mut h.client).await.payload {
		Payload::Error(e) => assert_eq!(e.code, codes::UNSUPPORTED_FRAME),
		other => panic!("expected error, got {other:?}"),
	}

	h.client.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
	assert_eq!(next_envelope(&mut h.client).await.message_type(), MessageType::Pong);
	assert_eq!(h.hub.connection_count().await.unwrap(), 1);
}

#[tokio::test]
async fn silent_peer_hits_the_read_deadline() {
	let settings = ConnectionSettings {
		pong_wait: Duration::from_millis(200),
		..ConnectionSettings::default()
	};
	let mut h = start(settings).await;

	// Never reading means never answering keepalive pings.
	wait_server(h.server).await;
	assert_eq!(h.hub.connection_count().await.unwrap(), 0);

	if let Some((code, reason)) = read_until_closed(&mut h.client).await {
		assert_eq!(code, CloseCode::Normal);
		assert_eq!(reason, "keepalive timeout");
	}
}

#[tokio::test]
async fn oversized_message_closes_the_connection() {
	let settings = ConnectionSettings {
		max_message_size: 64,
		..ConnectionSettings::default()
	};
	let mut h = start(settings).await;

	let big = format!(r#"{{"type":"ping","pad":"{}"}}"#, "x".repeat(256));
	let _ = h.client.send(Message::text(big)).await;

	let _ = read_until_closed(&mut h.client).await;
	wait_server(h.server).await;
	assert_eq!(h.hub.connection_count().await.unwrap(), 0);
}

#[tokio::test]
async fn client_close_unregisters() {
	let mut h = start(ConnectionSettings::default()).await;

	h.client.close(None).await.unwrap();
	wait_server(h.server).await;
	assert_eq!(h.hub.connection_count().await.unwrap(), 0);
}

#[tokio::test]
async fn hub_shutdown_sends_going_away() {
	let mut h = start(ConnectionSettings::default()).await;

	assert_eq!(h.hub.shutdown().await.unwrap(), 1);

	let (code, reason) = read_until_closed(&mut h.client).await.expect("close frame");
	assert_eq!(code, CloseCode::Away);
	assert_eq!(reason, "server shutting down");
	wait_server(h.server).await;
	assert_eq!(h.hub.connection_count().await.unwrap(), 0);
}

#[tokio::test]
async fn answered_pings_keep_the_connection_alive() {
	let settings = ConnectionSettings {
		pong_wait: Duration::from_secs(1),
		..ConnectionSettings::default()
	};
	let mut h = start(settings).await;

	// Reading lets the client answer keepalive pings; run well past several read deadlines.
	let until = Instant::now() + Duration::from_millis(3200);
	let mut pings = 0;
	loop {
		let now = Instant::now();
		if now >= until {
			break;
		}
		match timeout(until - now, h.client.next()).await {
			Err(_) => break,
			Ok(Some(Ok(Message::Ping(_)))) => pings += 1,
			Ok(Some(Ok(other))) => panic!("unexpected frame {other:?}"),
			Ok(other) => panic!("connection dropped: {other:?}"),
		}
	}

	assert!(pings >= 2, "saw {pings} keepalive pings");
	assert_eq!(h.hub.connection_count().await.unwrap(), 1);
	h.client.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
	assert_eq!(next_envelope(&mut h.client).await.message_type(), MessageType::Pong);
}

#[tokio::test]
async fn queued_frames_are_batched_in_order() {
	let (client_io, server_io) = tokio::io::duplex(64 * 1024);
	let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
	let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
	let (mut sink, _stream) = server_ws.split();

	let (tx, mut rx) = mpsc::channel::<Utf8Bytes>(16);
	for i in 1..5 {
		tx.try_send(Utf8Bytes::from(format!("frame-{i}"))).unwrap();
	}

	let n = write_batch(&mut sink, &mut rx, Utf8Bytes::from_static("frame-0"), 3).await.unwrap();
	assert_eq!(n, 3, "a batch stops at max_coalesce");

	let next = rx.recv().await.unwrap();
	let n = write_batch(&mut sink, &mut rx, next, 3).await.unwrap();
	assert_eq!(n, 2, "a batch stops when the queue is empty");

	for i in 0..5 {
		let msg = timeout(Duration::from_secs(2), client.next())
			.await
			.expect("frame within deadline")
			.expect("stream open")
			.expect("valid frame");
		assert_eq!(msg, Message::text(format!("frame-{i}")), "each frame stays a separate message");
	}
}

#[tokio::test]
async fn burst_of_hub_deliveries_arrives_in_order() {
	let mut h = start(ConnectionSettings {
		max_coalesce: 4,
		..ConnectionSettings::default()
	})
	.await;

	for i in 0..40 {
		h.hub
			.deliver(ConnectionId(1), &Envelope::error("burst", format!("m{i}")))
			.await
			.unwrap();
	}

	for i in 0..40 {
		match next_envelope(&mut h.client).await.payload {
			Payload::Error(e) => assert_eq!(e.message, format!("m{i}")),
			other => panic!("expected error envelope, got {other:?}"),
		}
	}
	assert_eq!(h.hub.connection_count().await.unwrap(), 1);
}

#[tokio::test]
async fn presence_snapshot_bigger_than_the_queue_is_delivered() {
	let (hub, _task) = Hub::spawn(HubConfig::default());

	let mut others = Vec::new();
	for i in 0..300u64 {
		let (tx, rx) = mpsc::channel(1024);
		let lifecycle = Arc::new(Lifecycle::new());
		lifecycle.transition(ConnState::Connecting, ConnState::Authenticated);
		let id = 100 + i as i64;
		let handle = ConnectionHandle::new(ConnectionId(100 + i), Identity::new(UserId(id), format!("user{i}")), tx, lifecycle);
		hub.register(handle).await.unwrap();
		others.push(rx);
	}

	let settings = ConnectionSettings {
		outbound_capacity: 8,
		..ConnectionSettings::default()
	};
	let mut h = start_on(hub, settings, 301).await;

	for i in 0..300 {
		match next_envelope(&mut h.client).await.payload {
			Payload::UserOnline(p) => assert_eq!(p.user_id, UserId(100 + i)),
			other => panic!("expected user_online, got {other:?}"),
		}
	}

	h.client.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
	assert_eq!(next_envelope(&mut h.client).await.message_type(), MessageType::Pong);
	assert_eq!(h.hub.connection_count().await.unwrap(), 301);
}
