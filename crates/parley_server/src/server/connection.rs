#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parley_domain::{ConnectionId, Identity};
use parley_protocol::{Envelope, Payload, PresenceEvent, ProtocolError, decode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, info, warn};

use crate::server::hub::{HubHandle, encode_frame};
use crate::server::lifecycle::{CloseReason, ConnState, Lifecycle};
use crate::server::registry::ConnectionHandle;
use crate::server::router::Router;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Largest inbound message in bytes; anything larger is a transport error.
	pub max_message_size: usize,
	/// Read deadline, refreshed by each pong.
	pub pong_wait: Duration,
	/// Deadline for every socket write.
	pub write_wait: Duration,
	/// Outbound queue capacity.
	pub outbound_capacity: usize,
	/// Most queued frames written per flush.
	pub max_coalesce: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_message_size: 512,
			pong_wait: Duration::from_secs(60),
			write_wait: Duration::from_secs(10),
			outbound_capacity: 256,
			max_coalesce: 64,
		}
	}
}

impl ConnectionSettings {
	/// Keepalive ping interval: nine tenths of `pong_wait`.
	pub fn ping_period(&self) -> Duration {
		self.pong_wait * 9 / 10
	}

	pub fn websocket_config(&self) -> WebSocketConfig {
		WebSocketConfig::default()
			.max_message_size(Some(self.max_message_size))
			.max_frame_size(Some(self.max_message_size))
	}
}

/// Drive one authenticated socket until it closes.
///
/// Registers with the hub, runs the outbound loop on its own task and the inbound loop on this one.
/// Whichever side fails first fires the close signal; both unregister, and the hub ignores the second call.
pub async fn run_connection<S>(
	ws: WebSocketStream<S>,
	conn_id: ConnectionId,
	identity: Identity,
	router: Router,
	settings: ConnectionSettings,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let lifecycle = Arc::new(Lifecycle::new());
	lifecycle.transition(ConnState::Connecting, ConnState::Authenticated);

	let (out_tx, out_rx) = mpsc::channel::<Utf8Bytes>(settings.outbound_capacity.max(1));
	let handle = ConnectionHandle::new(conn_id, identity.clone(), out_tx, Arc::clone(&lifecycle));

	let (mut sink, stream) = ws.split();

	let snapshot = match router.hub().register(handle).await {
		Ok(snapshot) => snapshot,
		Err(e) => {
			warn!(conn_id = %conn_id, user_id = %identity.user_id, error = %e, "hub registration failed");
			lifecycle.close(CloseReason::RegistrationFailed);
			let _ = timeout(settings.write_wait, sink.send(close_message(CloseReason::RegistrationFailed))).await;
			lifecycle.finish();
			return;
		}
	};

	info!(conn_id = %conn_id, user = %identity, online = snapshot.len(), "connection active");

	// Written ahead of the outbound queue; on failure both loops see the close signal and wind down.
	match timeout(settings.write_wait, write_presence_snapshot(&mut sink, snapshot)).await {
		Ok(Ok(n)) => {
			metrics::counter!("parley_server_frames_written_total").increment(n as u64);
		}
		Ok(Err(e)) => {
			debug!(conn_id = %conn_id, error = %e, "presence snapshot write failed");
			lifecycle.close(CloseReason::Transport);
		}
		Err(_) => {
			lifecycle.close(CloseReason::WriteTimeout);
		}
	}

	let writer = tokio::spawn(write_loop(
		sink,
		out_rx,
		Arc::clone(&lifecycle),
		router.hub().clone(),
		conn_id,
		settings.clone(),
	));

	let reason = read_loop(stream, conn_id, &identity, &router, &lifecycle, &settings).await;
	lifecycle.close(reason);
	router.hub().unregister(conn_id).await;

	if let Err(e) = writer.await {
		warn!(conn_id = %conn_id, error = %e, "writer task failed");
	}

	lifecycle.finish();
	let reason = lifecycle.close_reason().unwrap_or(reason);
	metrics::counter!("parley_server_disconnects_total", "reason" => reason.as_str()).increment(1);
	info!(conn_id = %conn_id, user = %identity, reason = reason.as_str(), "connection closed");
}

async fn read_loop<S>(
	mut stream: SplitStream<WebSocketStream<S>>,
	conn_id: ConnectionId,
	identity: &Identity,
	router: &Router,
	lifecycle: &Lifecycle,
	settings: &ConnectionSettings,
) -> CloseReason
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut deadline = Instant::now() + settings.pong_wait;

	loop {
		let next = tokio::select! {
			biased;
			reason = lifecycle.closed() => return reason,
			next = timeout_at(deadline, stream.next()) => next,
		};

		let msg = match next {
			Err(_) => {
				debug!(conn_id = %conn_id, "read deadline expired");
				metrics::counter!("parley_server_keepalive_timeouts_total").increment(1);
				return CloseReason::KeepaliveTimeout;
			}
			Ok(None) => return CloseReason::ClientClosed,
			Ok(Some(Err(e))) => {
				debug!(conn_id = %conn_id, error = %e, "read failed");
				return CloseReason::Transport;
			}
			Ok(Some(Ok(msg))) => msg,
		};

		let routed = match msg {
			Message::Text(text) => match decode(text.as_str()) {
				Ok(envelope) => router.route(conn_id, identity, envelope).await,
				Err(err) => router.reject(conn_id, &err).await,
			},
			Message::Binary(_) => router.reject(conn_id, &ProtocolError::BinaryFrame).await,
			Message::Pong(_) => {
				deadline = Instant::now() + settings.pong_wait;
				Ok(())
			}
			// Answered by the protocol layer.
			Message::Ping(_) => Ok(()),
			Message::Close(frame) => {
				debug!(conn_id = %conn_id, ?frame, "peer closed");
				return CloseReason::ClientClosed;
			}
			Message::Frame(_) => Ok(()),
		};

		if let Err(e) = routed {
			warn!(conn_id = %conn_id, error = %e, "routing stopped");
			return CloseReason::ServerShutdown;
		}
	}
}

async fn write_loop<S>(
	mut sink: SplitSink<WebSocketStream<S>, Message>,
	mut rx: mpsc::Receiver<Utf8Bytes>,
	lifecycle: Arc<Lifecycle>,
	hub: HubHandle,
	conn_id: ConnectionId,
	settings: ConnectionSettings,
) where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let period = settings.ping_period();
	let mut ping = tokio::time::interval_at(Instant::now() + period, period);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let failure = loop {
		tokio::select! {
			biased;
			reason = lifecycle.closed() => {
				let _ = timeout(settings.write_wait, sink.send(close_message(reason))).await;
				return;
			}
			frame = rx.recv() => {
				let Some(frame) = frame else {
					let _ = timeout(settings.write_wait, sink.send(close_message(CloseReason::ClientClosed))).await;
					return;
				};
				match timeout(settings.write_wait, write_batch(&mut sink, &mut rx, frame, settings.max_coalesce)).await {
					Ok(Ok(n)) => {
						metrics::counter!("parley_server_frames_written_total").increment(n as u64);
					}
					Ok(Err(e)) => {
						debug!(conn_id = %conn_id, error = %e, "write failed");
						break CloseReason::Transport;
					}
					Err(_) => break CloseReason::WriteTimeout,
				}
			}
			_ = ping.tick() => {
				match timeout(settings.write_wait, sink.send(Message::Ping(Bytes::new()))).await {
					Ok(Ok(())) => {}
					Ok(Err(e)) => {
						debug!(conn_id = %conn_id, error = %e, "keepalive ping failed");
						break CloseReason::Transport;
					}
					Err(_) => break CloseReason::WriteTimeout,
				}
			}
		}
	};

	warn!(conn_id = %conn_id, reason = failure.as_str(), "outbound loop failed");
	lifecycle.close(failure);
	hub.unregister(conn_id).await;
}

/// One `user_online` frame per already-online user, flushed once.
async fn write_presence_snapshot<S>(
	sink: &mut SplitSink<WebSocketStream<S>, Message>,
	snapshot: Vec<PresenceEvent>,
) -> Result<usize, tokio_tungstenite::tungstenite::Error>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut n = 0;
	for event in snapshot {
		if let Some(frame) = encode_frame(&Envelope::new(Payload::UserOnline(event))) {
			sink.feed(Message::Text(frame)).await?;
			n += 1;
		}
	}
	if n > 0 {
		sink.flush().await?;
	}
	Ok(n)
}

/// Writes `first` plus whatever is already queued (up to `max_coalesce` frames), then flushes once.
pub(crate) async fn write_batch<S>(
	sink: &mut SplitSink<WebSocketStream<S>, Message>,
	rx: &mut mpsc::Receiver<Utf8Bytes>,
	first: Utf8Bytes,
	max_coalesce: usize,
) -> Result<usize, tokio_tungstenite::tungstenite::Error>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	sink.feed(Message::Text(first)).await?;
	let mut n = 1;
	while n < max_coalesce.max(1) {
		match rx.try_recv() {
			Ok(frame) => {
				sink.feed(Message::Text(frame)).await?;
				n += 1;
			}
			Err(_) => break,
		}
	}
	sink.flush().await?;
	Ok(n)
}

fn close_message(reason: CloseReason) -> Message {
	Message::Close(Some(CloseFrame {
		code: CloseCode::from(reason.code()),
		reason: Utf8Bytes::from_static(reason.as_str()),
	}))
}
