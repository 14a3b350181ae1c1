#![forbid(unsafe_code)]

use core::fmt;

use chrono::{DateTime, Utc};
use parley_domain::{ConversationId, MessageId, RoomId, UserId};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Wire `type` discriminator. Each variant maps to exactly one payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
	RoomMessage,
	DirectMessage,
	JoinRoom,
	LeaveRoom,
	UserTyping,
	LoadRoomHistory,
	LoadConversation,
	UserOnline,
	UserOffline,
	Ping,
	Pong,
	Error,
	Success,
}

impl MessageType {
	pub const ALL: [MessageType; 13] = [
		MessageType::RoomMessage,
		MessageType::DirectMessage,
		MessageType::JoinRoom,
		MessageType::LeaveRoom,
		MessageType::UserTyping,
		MessageType::LoadRoomHistory,
		MessageType::LoadConversation,
		MessageType::UserOnline,
		MessageType::UserOffline,
		MessageType::Ping,
		MessageType::Pong,
		MessageType::Error,
		MessageType::Success,
	];

	/// Stable wire name.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageType::RoomMessage => "room_message",
			MessageType::DirectMessage => "direct_message",
			MessageType::JoinRoom => "join_room",
			MessageType::LeaveRoom => "leave_room",
			MessageType::UserTyping => "user_typing",
			MessageType::LoadRoomHistory => "load_room_history",
			MessageType::LoadConversation => "load_conversation",
			MessageType::UserOnline => "user_online",
			MessageType::UserOffline => "user_offline",
			MessageType::Ping => "ping",
			MessageType::Pong => "pong",
			MessageType::Error => "error",
			MessageType::Success => "success",
		}
	}

	pub fn from_wire(s: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|t| t.as_str() == s)
	}

	/// Types only the server may emit. Clients sending them get `unsupported_type`.
	pub const fn is_server_only(self) -> bool {
		matches!(
			self,
			MessageType::UserOnline | MessageType::UserOffline | MessageType::Pong | MessageType::Error | MessageType::Success
		)
	}

	/// Whether the type carries a payload object on the wire.
	pub const fn has_payload(self) -> bool {
		!matches!(self, MessageType::Ping | MessageType::Pong)
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// `room_message`. The stamped fields are filled by the server before fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
	pub room_id: RoomId,
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sender_id: Option<UserId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sender_username: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_id: Option<MessageId>,
}

/// `direct_message`. The stamped fields are filled by the server before delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
	pub to_user_id: UserId,
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub from_user_id: Option<UserId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub from_username: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conversation_id: Option<ConversationId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_id: Option<MessageId>,
}

/// `join_room` / `leave_room`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRef {
	pub room_id: RoomId,
}

/// `user_typing`. Exactly one of `room_id` / `to_user_id` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub to_user_id: Option<UserId>,
	pub is_typing: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<UserId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
}

/// One stored message inside a history page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
	pub message_id: MessageId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conversation_id: Option<ConversationId>,
	pub sender_id: UserId,
	pub sender_username: String,
	pub content: String,
	pub created_at: DateTime<Utc>,
}

/// `load_room_history` / `load_conversation`, both as request and as the page returned to the requester.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conversation_id: Option<ConversationId>,
	#[serde(default)]
	pub limit: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub before_id: Option<MessageId>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub messages: Vec<HistoryMessage>,
	/// Cursor for the next (older) page; absent once the history is exhausted.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub next_before_id: Option<MessageId>,
}

/// `user_online` / `user_offline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
	pub user_id: UserId,
	pub username: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_seen: Option<DateTime<Utc>>,
}

/// `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
	pub code: String,
	pub message: String,
}

/// `success` acknowledgement for the request named by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
	pub action: MessageType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_id: Option<MessageId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conversation_id: Option<ConversationId>,
	/// Direct messages only: whether the recipient had at least one live connection.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delivered: Option<bool>,
}

impl Ack {
	pub fn new(action: MessageType) -> Self {
		Self {
			action,
			room_id: None,
			message_id: None,
			conversation_id: None,
			delivered: None,
		}
	}
}

/// Typed payload union; the variant is the wire `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
	RoomMessage(RoomMessage),
	DirectMessage(DirectMessage),
	JoinRoom(RoomRef),
	LeaveRoom(RoomRef),
	UserTyping(Typing),
	LoadRoomHistory(HistoryPage),
	LoadConversation(HistoryPage),
	UserOnline(PresenceEvent),
	UserOffline(PresenceEvent),
	Ping,
	Pong,
	Error(ErrorBody),
	Success(Ack),
}

impl Payload {
	pub fn message_type(&self) -> MessageType {
		match self {
			Payload::RoomMessage(_) => MessageType::RoomMessage,
			Payload::DirectMessage(_) => MessageType::DirectMessage,
			Payload::JoinRoom(_) => MessageType::JoinRoom,
			Payload::LeaveRoom(_) => MessageType::LeaveRoom,
			Payload::UserTyping(_) => MessageType::UserTyping,
			Payload::LoadRoomHistory(_) => MessageType::LoadRoomHistory,
			Payload::LoadConversation(_) => MessageType::LoadConversation,
			Payload::UserOnline(_) => MessageType::UserOnline,
			Payload::UserOffline(_) => MessageType::UserOffline,
			Payload::Ping => MessageType::Ping,
			Payload::Pong => MessageType::Pong,
			Payload::Error(_) => MessageType::Error,
			Payload::Success(_) => MessageType::Success,
		}
	}
}

/// Wire envelope `{type, payload, timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
	pub payload: Payload,
	pub timestamp: DateTime<Utc>,
}

impl Envelope {
	/// Envelope stamped with the current server time.
	pub fn new(payload: Payload) -> Self {
		Self {
			payload,
			timestamp: Utc::now(),
		}
	}

	pub fn message_type(&self) -> MessageType {
		self.payload.message_type()
	}

	pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::new(Payload::Error(ErrorBody {
			code: code.into(),
			message: message.into(),
		}))
	}

	pub fn ack(ack: Ack) -> Self {
		Self::new(Payload::Success(ack))
	}
}

impl Serialize for Envelope {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let kind = self.message_type();
		let len = if kind.has_payload() { 3 } else { 2 };
		let mut map = serializer.serialize_map(Some(len))?;
		map.serialize_entry("type", kind.as_str())?;
		match &self.payload {
			Payload::RoomMessage(p) => map.serialize_entry("payload", p)?,
			Payload::DirectMessage(p) => map.serialize_entry("payload", p)?,
			Payload::JoinRoom(p) | Payload::LeaveRoom(p) => map.serialize_entry("payload", p)?,
			Payload::UserTyping(p) => map.serialize_entry("payload", p)?,
			Payload::LoadRoomHistory(p) | Payload::LoadConversation(p) => map.serialize_entry("payload", p)?,
			Payload::UserOnline(p) | Payload::UserOffline(p) => map.serialize_entry("payload", p)?,
			Payload::Error(p) => map.serialize_entry("payload", p)?,
			Payload::Success(p) => map.serialize_entry("payload", p)?,
			Payload::Ping | Payload::Pong => {}
		}
		map.serialize_entry("timestamp", &self.timestamp)?;
		map.end()
	}
}
