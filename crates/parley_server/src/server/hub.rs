#![forbid(unsafe_code)]

use parley_domain::{ConnectionId, Identity, RoomId, UserId};
use parley_protocol::{Ack, Envelope, MessageType, Payload, PresenceEvent, codes, encode};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, info, warn};

use crate::server::lifecycle::{CloseReason, ConnState};
use crate::server::registry::{ConnectionHandle, Presence, Registry};

/// Who receives `user_online` / `user_offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceScope {
	/// Every connected user.
	#[default]
	Global,
	/// Only users sharing a room.
	Rooms,
}

impl PresenceScope {
	pub fn parse(s: &str) -> Option<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"global" => Some(PresenceScope::Global),
			"rooms" => Some(PresenceScope::Rooms),
			_ => None,
		}
	}
}

/// Configuration for `Hub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Bounded command intake.
	pub command_capacity: usize,
	pub presence_scope: PresenceScope,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			command_capacity: 4096,
			presence_scope: PresenceScope::Global,
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
	#[error("hub is not running")]
	Closed,
	#[error("connection {0} is not in the authenticated state")]
	NotAuthenticated(ConnectionId),
	#[error("connection {0} is already registered")]
	AlreadyRegistered(ConnectionId),
}

/// Frames are encoded once and shared by every recipient.
pub fn encode_frame(envelope: &Envelope) -> Option<Utf8Bytes> {
	match encode(envelope) {
		Ok(text) => Some(Utf8Bytes::from(text)),
		Err(e) => {
			warn!(error = %e, kind = %envelope.message_type(), "failed to encode outbound envelope");
			None
		}
	}
}

enum HubCommand {
	Register {
		handle: ConnectionHandle,
		reply: oneshot::Sender<Result<Vec<PresenceEvent>, HubError>>,
	},
	Unregister {
		conn: ConnectionId,
	},
	Join {
		conn: ConnectionId,
		room: RoomId,
	},
	Leave {
		conn: ConnectionId,
		room: RoomId,
	},
	IsMember {
		conn: ConnectionId,
		room: RoomId,
		reply: oneshot::Sender<bool>,
	},
	BroadcastRoom {
		origin: ConnectionId,
		room: RoomId,
		frame: Utf8Bytes,
		ack: Ack,
	},
	SendDirect {
		origin: ConnectionId,
		to: UserId,
		frame: Utf8Bytes,
		ack: Ack,
	},
	TypingRoom {
		origin: ConnectionId,
		room: RoomId,
		frame: Utf8Bytes,
	},
	TypingUser {
		origin: ConnectionId,
		to: UserId,
		frame: Utf8Bytes,
	},
	Deliver {
		conn: ConnectionId,
		frame: Utf8Bytes,
	},
	RoomMembers {
		room: RoomId,
		reply: oneshot::Sender<Vec<ConnectionId>>,
	},
	Presence {
		user: UserId,
		reply: oneshot::Sender<Option<Presence>>,
	},
	ConnectionCount {
		reply: oneshot::Sender<usize>,
	},
	Shutdown {
		reply: oneshot::Sender<usize>,
	},
}

/// Cloneable handle to the hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
	tx: mpsc::Sender<HubCommand>,
}

impl std::fmt::Debug for HubCommand {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.name())
	}
}

impl HubCommand {
	fn name(&self) -> &'static str {
		match self {
			HubCommand::Register { .. } => "register",
			HubCommand::Unregister { .. } => "unregister",
			HubCommand::Join { .. } => "join",
			HubCommand::Leave { .. } => "leave",
			HubCommand::IsMember { .. } => "is_member",
			HubCommand::BroadcastRoom { .. } => "broadcast_room",
			HubCommand::SendDirect { .. } => "send_direct",
			HubCommand::TypingRoom { .. } => "typing_room",
			HubCommand::TypingUser { .. } => "typing_user",
			HubCommand::Deliver { .. } => "deliver",
			HubCommand::RoomMembers { .. } => "room_members",
			HubCommand::Presence { .. } => "presence",
			HubCommand::ConnectionCount { .. } => "connection_count",
			HubCommand::Shutdown { .. } => "shutdown",
		}
	}
}

/// Single authority over the registry.
///
/// Consumes a bounded command stream and never awaits I/O: every hand-off to a connection is a `try_send`,
/// and a full queue disconnects that connection with `slow consumer`.
pub struct Hub {
	cfg: HubConfig,
	registry: Registry,
	rx: mpsc::Receiver<HubCommand>,
}

impl Hub {
	/// Spawn the hub task.
	pub fn spawn(cfg: HubConfig) -> (HubHandle, JoinHandle<()>) {
		let (tx, rx) = mpsc::channel(cfg.command_capacity.max(1));
		let hub = Hub {
			cfg,
			registry: Registry::default(),
			rx,
		};
		let task = tokio::spawn(hub.run());
		(HubHandle { tx }, task)
	}

	async fn run(mut self) {
		while let Some(cmd) = self.rx.recv().await {
			self.handle(cmd);
		}
		debug!("hub: command stream closed");
	}

	fn handle(&mut self, cmd: HubCommand) {
		match cmd {
			HubCommand::Register { handle, reply } => {
				let _ = reply.send(self.register(handle));
			}
			HubCommand::Unregister { conn } => {
				self.unregister(conn, None);
			}
			HubCommand::Join { conn, room } => self.join(conn, room),
			HubCommand::Leave { conn, room } => self.leave(conn, room),
			HubCommand::IsMember { conn, room, reply } => {
				let _ = reply.send(self.registry.is_member(conn, room));
			}
			HubCommand::BroadcastRoom {
				origin,
				room,
				frame,
				ack,
			} => self.broadcast_room(origin, room, frame, ack),
			HubCommand::SendDirect { origin, to, frame, ack } => self.send_direct(origin, to, frame, ack),
			HubCommand::TypingRoom { origin, room, frame } => self.typing_room(origin, room, frame),
			HubCommand::TypingUser { origin, to, frame } => self.typing_user(origin, to, frame),
			HubCommand::Deliver { conn, frame } => {
				self.send_to(conn, frame);
			}
			HubCommand::RoomMembers { room, reply } => {
				let _ = reply.send(self.registry.members(room));
			}
			HubCommand::Presence { user, reply } => {
				let _ = reply.send(self.registry.presence(user));
			}
			HubCommand::ConnectionCount { reply } => {
				let _ = reply.send(self.registry.connection_count());
			}
			HubCommand::Shutdown { reply } => {
				let _ = reply.send(self.shutdown());
			}
		}
	}

	/// Index the connection and announce the user if this is their first connection.
	///
	/// The snapshot of already-online users is returned to the caller instead of being queued: it can be
	/// larger than the outbound queue, and the connection writes it to the socket before its writer starts.
	fn register(&mut self, handle: ConnectionHandle) -> Result<Vec<PresenceEvent>, HubError> {
		let conn = handle.id;
		if self.registry.handle(conn).is_some() {
			return Err(HubError::AlreadyRegistered(conn));
		}
		if !handle
			.lifecycle()
			.transition(ConnState::Authenticated, ConnState::Active)
		{
			return Err(HubError::NotAuthenticated(conn));
		}

		let identity = handle.identity.clone();
		let first = self.registry.insert(handle);

		metrics::gauge!("parley_server_registered_connections").set(self.registry.connection_count() as f64);
		metrics::gauge!("parley_server_online_users").set(self.registry.online_user_count() as f64);
		info!(conn_id = %conn, user_id = %identity.user_id, first, "hub: registered connection");

		let snapshot = match self.cfg.presence_scope {
			PresenceScope::Global => self.registry.online_users(identity.user_id),
			PresenceScope::Rooms => self.registry.co_member_users(identity.user_id),
		};

		if first {
			let env = Envelope::new(Payload::UserOnline(PresenceEvent {
				user_id: identity.user_id,
				username: identity.username.clone(),
				last_seen: None,
			}));
			let audience = self.presence_audience(&identity, None);
			self.fan_out(&audience, &env);
			metrics::counter!("parley_server_presence_online_total").increment(1);
		}

		Ok(snapshot
			.into_iter()
			.map(|(user_id, username)| PresenceEvent {
				user_id,
				username,
				last_seen: None,
			})
			.collect())
	}

	/// Removes a connection; `close` additionally fires its close signal. No-op for unknown ids.
	fn unregister(&mut self, conn: ConnectionId, close: Option<CloseReason>) {
		let Some(removed) = self.registry.remove(conn) else {
			return;
		};

		if let Some(reason) = close {
			removed.handle.lifecycle().close(reason);
		} else {
			removed.handle.lifecycle().begin_closing();
		}

		metrics::gauge!("parley_server_registered_connections").set(self.registry.connection_count() as f64);
		metrics::gauge!("parley_server_rooms").set(self.registry.room_count() as f64);
		debug!(
			conn_id = %conn,
			user_id = %removed.handle.user_id(),
			rooms = removed.rooms.len(),
			last = removed.last_for_user(),
			"hub: unregistered connection"
		);

		if let Some(last_seen) = removed.last_seen {
			metrics::gauge!("parley_server_online_users").set(self.registry.online_user_count() as f64);
			let identity = removed.handle.identity.clone();
			let env = Envelope::new(Payload::UserOffline(PresenceEvent {
				user_id: identity.user_id,
				username: identity.username.clone(),
				last_seen: Some(last_seen),
			}));
			let audience = self.presence_audience(&identity, Some(&removed.rooms));
			self.fan_out(&audience, &env);
			metrics::counter!("parley_server_presence_offline_total").increment(1);
		}
	}

	fn presence_audience(&self, identity: &Identity, rooms: Option<&[RoomId]>) -> Vec<ConnectionId> {
		match self.cfg.presence_scope {
			PresenceScope::Global => self
				.registry
				.all_connections()
				.into_iter()
				.filter(|c| {
					self.registry
						.handle(*c)
						.is_some_and(|h| h.user_id() != identity.user_id)
				})
				.collect(),
			PresenceScope::Rooms => match rooms {
				Some(rooms) => self.registry.co_members_in(identity.user_id, rooms.iter().copied()),
				None => self.registry.co_members(identity.user_id),
			},
		}
	}

	fn join(&mut self, conn: ConnectionId, room: RoomId) {
		match self.registry.join(conn, room) {
			Some(added) => {
				if added {
					metrics::counter!("parley_server_room_joins_total").increment(1);
					metrics::gauge!("parley_server_rooms").set(self.registry.room_count() as f64);
				}
				debug!(conn_id = %conn, room_id = %room, added, "hub: join");
				let mut ack = Ack::new(MessageType::JoinRoom);
				ack.room_id = Some(room);
				self.ack(conn, ack);
			}
			None => debug!(conn_id = %conn, room_id = %room, "hub: join from unknown connection"),
		}
	}

	fn leave(&mut self, conn: ConnectionId, room: RoomId) {
		let removed = self.registry.leave(conn, room);
		if removed {
			metrics::gauge!("parley_server_rooms").set(self.registry.room_count() as f64);
		}
		debug!(conn_id = %conn, room_id = %room, removed, "hub: leave");
		let mut ack = Ack::new(MessageType::LeaveRoom);
		ack.room_id = Some(room);
		self.ack(conn, ack);
	}

	fn broadcast_room(&mut self, origin: ConnectionId, room: RoomId, frame: Utf8Bytes, ack: Ack) {
		if !self.registry.is_member(origin, room) {
			self.error(origin, codes::NOT_A_MEMBER, format!("not a member of room {room}"));
			return;
		}

		let recipients: Vec<ConnectionId> = self
			.registry
			.members(room)
			.into_iter()
			.filter(|c| *c != origin)
			.collect();
		let delivered = self.fan_out_frame(&recipients, &frame);
		metrics::counter!("parley_server_room_messages_total").increment(1);
		debug!(conn_id = %origin, room_id = %room, recipients = recipients.len(), delivered, "hub: room broadcast");

		self.ack(origin, ack);
	}

	fn send_direct(&mut self, origin: ConnectionId, to: UserId, frame: Utf8Bytes, mut ack: Ack) {
		let Some(sender) = self.registry.handle(origin).map(|h| h.user_id()) else {
			return;
		};

		let targets = self.registry.user_connections(to);
		let delivered = self.fan_out_frame(&targets, &frame) > 0;

		let own: Vec<ConnectionId> = self
			.registry
			.user_connections(sender)
			.into_iter()
			.filter(|c| *c != origin)
			.collect();
		self.fan_out_frame(&own, &frame);

		if delivered {
			metrics::counter!("parley_server_direct_messages_delivered_total").increment(1);
		} else {
			metrics::counter!("parley_server_direct_messages_undelivered_total").increment(1);
		}
		debug!(conn_id = %origin, to_user_id = %to, delivered, "hub: direct message");

		ack.delivered = Some(delivered);
		self.ack(origin, ack);
	}

	fn typing_room(&mut self, origin: ConnectionId, room: RoomId, frame: Utf8Bytes) {
		let Some(sender) = self.registry.handle(origin).map(|h| h.user_id()) else {
			return;
		};
		if !self.registry.is_member(origin, room) {
			self.error(origin, codes::NOT_A_MEMBER, format!("not a member of room {room}"));
			return;
		}

		let recipients: Vec<ConnectionId> = self
			.registry
			.members(room)
			.into_iter()
			.filter(|c| self.registry.handle(*c).is_some_and(|h| h.user_id() != sender))
			.collect();
		self.fan_out_frame(&recipients, &frame);
	}

	fn typing_user(&mut self, origin: ConnectionId, to: UserId, frame: Utf8Bytes) {
		if self.registry.handle(origin).is_none() {
			return;
		}
		let targets = self.registry.user_connections(to);
		self.fan_out_frame(&targets, &frame);
	}

	fn shutdown(&mut self) -> usize {
		let conns = self.registry.all_connections();
		let n = conns.len();
		for conn in conns {
			if let Some(handle) = self.registry.handle(conn) {
				handle.lifecycle().close(CloseReason::ServerShutdown);
			}
		}
		info!(connections = n, "hub: closing all connections for shutdown");
		n
	}

	fn ack(&mut self, conn: ConnectionId, ack: Ack) {
		if let Some(frame) = encode_frame(&Envelope::ack(ack)) {
			self.send_to(conn, frame);
		}
	}

	fn error(&mut self, conn: ConnectionId, code: &str, message: String) {
		metrics::counter!("parley_server_routing_rejections_total", "code" => code.to_string()).increment(1);
		if let Some(frame) = encode_frame(&Envelope::error(code, message)) {
			self.send_to(conn, frame);
		}
	}

	fn fan_out(&mut self, recipients: &[ConnectionId], envelope: &Envelope) -> usize {
		match encode_frame(envelope) {
			Some(frame) => self.fan_out_frame(recipients, &frame),
			None => 0,
		}
	}

	fn fan_out_frame(&mut self, recipients: &[ConnectionId], frame: &Utf8Bytes) -> usize {
		recipients
			.iter()
			.filter(|conn| self.send_to(**conn, frame.clone()))
			.count()
	}

	/// Non-blocking enqueue. A full queue drops the frame and disconnects the connection.
	fn send_to(&mut self, conn: ConnectionId, frame: Utf8Bytes) -> bool {
		let Some(handle) = self.registry.handle(conn) else {
			return false;
		};
		if !handle.lifecycle().is_active() {
			return false;
		}

		match handle.try_send(frame) {
			Ok(()) => {
				metrics::counter!("parley_server_envelopes_out_total").increment(1);
				true
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(conn_id = %conn, user_id = %handle.user_id(), "hub: outbound queue full; disconnecting slow consumer");
				metrics::counter!("parley_server_slow_consumer_disconnects_total").increment(1);
				self.unregister(conn, Some(CloseReason::SlowConsumer));
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				debug!(conn_id = %conn, "hub: outbound queue closed; unregistering");
				self.unregister(conn, Some(CloseReason::Transport));
				false
			}
		}
	}
}

impl HubHandle {
	async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
		self.tx.send(cmd).await.map_err(|_| HubError::Closed)
	}

	async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Result<T, HubError> {
		let (tx, rx) = oneshot::channel();
		self.send(build(tx)).await?;
		rx.await.map_err(|_| HubError::Closed)
	}

	/// Register an authenticated connection and mark it `Active`.
	///
	/// Returns the users already online in the connection's presence scope; they are not queued.
	pub async fn register(&self, handle: ConnectionHandle) -> Result<Vec<PresenceEvent>, HubError> {
		self.ask(|reply| HubCommand::Register { handle, reply }).await?
	}

	/// Idempotent; safe to call from either connection loop.
	pub async fn unregister(&self, conn: ConnectionId) {
		let _ = self.send(HubCommand::Unregister { conn }).await;
	}

	pub async fn join(&self, conn: ConnectionId, room: RoomId) -> Result<(), HubError> {
		self.send(HubCommand::Join { conn, room }).await
	}

	pub async fn leave(&self, conn: ConnectionId, room: RoomId) -> Result<(), HubError> {
		self.send(HubCommand::Leave { conn, room }).await
	}

	pub async fn is_member(&self, conn: ConnectionId, room: RoomId) -> Result<bool, HubError> {
		self.ask(|reply| HubCommand::IsMember { conn, room, reply }).await
	}

	/// Fan a stamped `room_message` out to every member except `origin`, then ack `origin`.
	pub async fn broadcast_room(&self, origin: ConnectionId, room: RoomId, envelope: &Envelope, ack: Ack) -> Result<(), HubError> {
		let Some(frame) = encode_frame(envelope) else {
			return Ok(());
		};
		self.send(HubCommand::BroadcastRoom {
			origin,
			room,
			frame,
			ack,
		})
		.await
	}

	/// Deliver a stamped `direct_message` to the target's and the sender's other connections.
	/// `ack.delivered` is filled by the hub.
	pub async fn send_direct(&self, origin: ConnectionId, to: UserId, envelope: &Envelope, ack: Ack) -> Result<(), HubError> {
		let Some(frame) = encode_frame(envelope) else {
			return Ok(());
		};
		self.send(HubCommand::SendDirect { origin, to, frame, ack }).await
	}

	pub async fn typing_room(&self, origin: ConnectionId, room: RoomId, envelope: &Envelope) -> Result<(), HubError> {
		let Some(frame) = encode_frame(envelope) else {
			return Ok(());
		};
		self.send(HubCommand::TypingRoom { origin, room, frame }).await
	}

	pub async fn typing_user(&self, origin: ConnectionId, to: UserId, envelope: &Envelope) -> Result<(), HubError> {
		let Some(frame) = encode_frame(envelope) else {
			return Ok(());
		};
		self.send(HubCommand::TypingUser { origin, to, frame }).await
	}

	/// Send one envelope to one connection, in hub order.
	pub async fn deliver(&self, conn: ConnectionId, envelope: &Envelope) -> Result<(), HubError> {
		let Some(frame) = encode_frame(envelope) else {
			return Ok(());
		};
		self.send(HubCommand::Deliver { conn, frame }).await
	}

	pub async fn room_members(&self, room: RoomId) -> Result<Vec<ConnectionId>, HubError> {
		self.ask(|reply| HubCommand::RoomMembers { room, reply }).await
	}

	/// `None` once the user's last connection is gone.
	pub async fn presence(&self, user: UserId) -> Result<Option<Presence>, HubError> {
		self.ask(|reply| HubCommand::Presence { user, reply }).await
	}

	pub async fn connection_count(&self) -> Result<usize, HubError> {
		self.ask(|reply| HubCommand::ConnectionCount { reply }).await
	}

	/// Fire `server shutting down` on every registered connection. Returns how many were signalled.
	pub async fn shutdown(&self) -> Result<usize, HubError> {
		self.ask(|reply| HubCommand::Shutdown { reply }).await
	}
}
