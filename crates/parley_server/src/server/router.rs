#![forbid(unsafe_code)]

use parley_domain::{ConnectionId, Identity};
use parley_protocol::{
	Ack, DirectMessage, Envelope, HistoryPage, MessageType, Payload, ProtocolError, RoomMessage, RoomRef, Typing, codes,
};
use tracing::{debug, warn};

use crate::server::hub::{HubError, HubHandle};
use crate::server::store::{StoredMessage, Stores};

/// Limits applied while routing.
#[derive(Debug, Clone)]
pub struct RouterConfig {
	pub history_default_limit: u32,
	pub history_max_limit: u32,
	/// Maximum content length in characters.
	pub max_content_len: usize,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			history_default_limit: 50,
			history_max_limit: 100,
			max_content_len: 4000,
		}
	}
}

impl RouterConfig {
	/// `0` means "use the default"; anything else is capped at the maximum.
	pub fn clamp_limit(&self, requested: u32) -> u32 {
		let max = self.history_max_limit.max(1);
		if requested == 0 {
			self.history_default_limit.clamp(1, max)
		} else {
			requested.min(max)
		}
	}
}

/// Routes decoded envelopes for one connection.
///
/// Runs on the connection's inbound task: collaborator calls (persistence, history) happen here, in
/// inbound order, and the registry-dependent part is handed to the hub. A store failure stops the
/// operation before anything is fanned out.
#[derive(Clone)]
pub struct Router {
	hub: HubHandle,
	stores: Stores,
	cfg: RouterConfig,
}

impl Router {
	pub fn new(hub: HubHandle, stores: Stores, cfg: RouterConfig) -> Self {
		Self { hub, stores, cfg }
	}

	pub fn hub(&self) -> &HubHandle {
		&self.hub
	}

	/// Route one envelope. Only a stopped hub is an error; routing rejections go back to the sender.
	pub async fn route(&self, conn: ConnectionId, identity: &Identity, envelope: Envelope) -> Result<(), HubError> {
		let kind = envelope.message_type();
		metrics::counter!("parley_server_envelopes_in_total", "type" => kind.as_str()).increment(1);

		match envelope.payload {
			Payload::RoomMessage(msg) => self.room_message(conn, identity, msg).await,
			Payload::DirectMessage(msg) => self.direct_message(conn, identity, msg).await,
			Payload::JoinRoom(RoomRef { room_id }) => self.hub.join(conn, room_id).await,
			Payload::LeaveRoom(RoomRef { room_id }) => self.hub.leave(conn, room_id).await,
			Payload::UserTyping(typing) => self.typing(conn, identity, typing).await,
			Payload::LoadRoomHistory(page) => self.room_history(conn, page).await,
			Payload::LoadConversation(page) => self.conversation_history(conn, identity, page).await,
			Payload::Ping => self.hub.deliver(conn, &Envelope::new(Payload::Pong)).await,
			Payload::UserOnline(_) | Payload::UserOffline(_) | Payload::Pong | Payload::Error(_) | Payload::Success(_) => {
				self.reject(conn, &ProtocolError::ServerOnly(kind)).await
			}
		}
	}

	/// Report a protocol error to the sender. The connection stays open.
	pub async fn reject(&self, conn: ConnectionId, err: &ProtocolError) -> Result<(), HubError> {
		metrics::counter!("parley_server_protocol_errors_total", "code" => err.code()).increment(1);
		debug!(conn_id = %conn, code = err.code(), error = %err, "protocol error");
		self.hub.deliver(conn, &err.to_envelope()).await
	}

	async fn error(&self, conn: ConnectionId, code: &'static str, message: String) -> Result<(), HubError> {
		metrics::counter!("parley_server_routing_rejections_total", "code" => code).increment(1);
		self.hub.deliver(conn, &Envelope::error(code, message)).await
	}

	async fn upstream(&self, conn: ConnectionId, what: &str, err: anyhow::Error) -> Result<(), HubError> {
		warn!(conn_id = %conn, error = %err, "{what} failed");
		metrics::counter!("parley_server_store_errors_total").increment(1);
		self.hub
			.deliver(conn, &Envelope::error(codes::UPSTREAM_UNAVAILABLE, format!("{what} is unavailable")))
			.await
	}

	fn check_content(&self, kind: MessageType, content: &str) -> Result<(), ProtocolError> {
		let len = content.chars().count();
		if len > self.cfg.max_content_len {
			return Err(ProtocolError::InvalidPayload {
				kind,
				reason: format!("content exceeds {} characters", self.cfg.max_content_len),
			});
		}
		Ok(())
	}

	async fn room_message(&self, conn: ConnectionId, identity: &Identity, mut msg: RoomMessage) -> Result<(), HubError> {
		if let Err(e) = self.check_content(MessageType::RoomMessage, &msg.content) {
			return self.reject(conn, &e).await;
		}

		let room = msg.room_id;
		if !self.hub.is_member(conn, room).await? {
			return self.error(conn, codes::NOT_A_MEMBER, format!("not a member of room {room}")).await;
		}

		let message_id = match self
			.stores
			.messages
			.persist_room_message(room, identity, &msg.content)
			.await
		{
			Ok(id) => id,
			Err(e) => return self.upstream(conn, "message store", e).await,
		};

		msg.sender_id = Some(identity.user_id);
		msg.sender_username = Some(identity.username.clone());
		msg.message_id = Some(message_id);

		let mut ack = Ack::new(MessageType::RoomMessage);
		ack.room_id = Some(room);
		ack.message_id = Some(message_id);

		self.hub
			.broadcast_room(conn, room, &Envelope::new(Payload::RoomMessage(msg)), ack)
			.await
	}

	async fn direct_message(&self, conn: ConnectionId, identity: &Identity, mut msg: DirectMessage) -> Result<(), HubError> {
		if let Err(e) = self.check_content(MessageType::DirectMessage, &msg.content) {
			return self.reject(conn, &e).await;
		}

		let to = msg.to_user_id;
		if to == identity.user_id {
			return self
				.error(conn, codes::INVALID_TARGET, "cannot send a direct message to yourself".to_string())
				.await;
		}

		let (conversation_id, message_id) = match self
			.stores
			.messages
			.persist_direct_message(identity, to, &msg.content)
			.await
		{
			Ok(ids) => ids,
			Err(e) => return self.upstream(conn, "message store", e).await,
		};

		msg.from_user_id = Some(identity.user_id);
		msg.from_username = Some(identity.username.clone());
		msg.conversation_id = Some(conversation_id);
		msg.message_id = Some(message_id);

		let mut ack = Ack::new(MessageType::DirectMessage);
		ack.conversation_id = Some(conversation_id);
		ack.message_id = Some(message_id);

		self.hub
			.send_direct(conn, to, &Envelope::new(Payload::DirectMessage(msg)), ack)
			.await
	}

	async fn typing(&self, conn: ConnectionId, identity: &Identity, mut typing: Typing) -> Result<(), HubError> {
		typing.user_id = Some(identity.user_id);
		typing.username = Some(identity.username.clone());

		match (typing.room_id, typing.to_user_id) {
			(Some(room), _) => {
				self.hub
					.typing_room(conn, room, &Envelope::new(Payload::UserTyping(typing)))
					.await
			}
			(None, Some(to)) if to == identity.user_id => {
				self.error(conn, codes::INVALID_TARGET, "cannot send typing to yourself".to_string())
					.await
			}
			(None, Some(to)) => {
				self.hub
					.typing_user(conn, to, &Envelope::new(Payload::UserTyping(typing)))
					.await
			}
			(None, None) => {
				self.reject(
					conn,
					&ProtocolError::InvalidPayload {
						kind: MessageType::UserTyping,
						reason: "exactly one of room_id or to_user_id is required".to_string(),
					},
				)
				.await
			}
		}
	}

	async fn room_history(&self, conn: ConnectionId, req: HistoryPage) -> Result<(), HubError> {
		let Some(room) = req.room_id else {
			return self
				.reject(
					conn,
					&ProtocolError::InvalidPayload {
						kind: MessageType::LoadRoomHistory,
						reason: "room_id is required".to_string(),
					},
				)
				.await;
		};

		if !self.hub.is_member(conn, room).await? {
			return self.error(conn, codes::NOT_A_MEMBER, format!("not a member of room {room}")).await;
		}

		let limit = self.cfg.clamp_limit(req.limit);
		let rows = match self
			.stores
			.history
			.fetch_room_history(room, req.before_id, limit.saturating_add(1))
			.await
		{
			Ok(rows) => rows,
			Err(e) => return self.upstream(conn, "history store", e).await,
		};

		let page = build_page(
			HistoryPage {
				room_id: Some(room),
				limit,
				before_id: req.before_id,
				..HistoryPage::default()
			},
			rows,
		);
		self.hub
			.deliver(conn, &Envelope::new(Payload::LoadRoomHistory(page)))
			.await
	}

	async fn conversation_history(&self, conn: ConnectionId, identity: &Identity, req: HistoryPage) -> Result<(), HubError> {
		let Some(conversation) = req.conversation_id else {
			return self
				.reject(
					conn,
					&ProtocolError::InvalidPayload {
						kind: MessageType::LoadConversation,
						reason: "conversation_id is required".to_string(),
					},
				)
				.await;
		};

		let limit = self.cfg.clamp_limit(req.limit);
		let rows = match self
			.stores
			.history
			.fetch_conversation(conversation, identity.user_id, req.before_id, limit.saturating_add(1))
			.await
		{
			Ok(Some(rows)) => rows,
			Ok(None) => {
				return self
					.error(
						conn,
						codes::FORBIDDEN,
						format!("not a participant of conversation {conversation}"),
					)
					.await;
			}
			Err(e) => return self.upstream(conn, "history store", e).await,
		};

		let page = build_page(
			HistoryPage {
				conversation_id: Some(conversation),
				limit,
				before_id: req.before_id,
				..HistoryPage::default()
			},
			rows,
		);
		self.hub
			.deliver(conn, &Envelope::new(Payload::LoadConversation(page)))
			.await
	}
}

/// `rows` was fetched with `limit + 1`; the extra row only signals that an older page exists.
fn build_page(mut page: HistoryPage, mut rows: Vec<StoredMessage>) -> HistoryPage {
	let limit = page.limit as usize;
	let more = rows.len() > limit;
	rows.truncate(limit);

	page.next_before_id = if more { rows.last().map(|m| m.id) } else { None };
	page.messages = rows.iter().map(StoredMessage::to_history).collect();
	page
}
