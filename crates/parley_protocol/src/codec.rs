#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::envelope::{Envelope, HistoryPage, MessageType, Payload, Typing};

/// Stable `error.code` values sent to clients.
pub mod codes {
	pub const MALFORMED_ENVELOPE: &str = "malformed_envelope";
	pub const UNKNOWN_TYPE: &str = "unknown_type";
	pub const INVALID_PAYLOAD: &str = "invalid_payload";
	pub const UNSUPPORTED_TYPE: &str = "unsupported_type";
	pub const UNSUPPORTED_FRAME: &str = "unsupported_frame";
	pub const NOT_A_MEMBER: &str = "not_a_member";
	pub const INVALID_TARGET: &str = "invalid_target";
	pub const FORBIDDEN: &str = "forbidden";
	pub const UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
}

/// Recoverable protocol violation. The connection stays open; the sender gets one `error` envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
	#[error("malformed envelope: {0}")]
	Malformed(String),

	#[error("unknown message type: {0:?}")]
	UnknownType(String),

	#[error("missing payload for {0}")]
	MissingPayload(MessageType),

	#[error("invalid {kind} payload: {reason}")]
	InvalidPayload {
		kind: MessageType,
		reason: String,
	},

	#[error("{0} is not accepted from clients")]
	ServerOnly(MessageType),

	#[error("binary frames are not supported")]
	BinaryFrame,

	#[error("failed to encode envelope: {0}")]
	Encode(String),
}

impl ProtocolError {
	pub fn code(&self) -> &'static str {
		match self {
			ProtocolError::Malformed(_) | ProtocolError::Encode(_) => codes::MALFORMED_ENVELOPE,
			ProtocolError::UnknownType(_) => codes::UNKNOWN_TYPE,
			ProtocolError::MissingPayload(_) | ProtocolError::InvalidPayload { .. } => codes::INVALID_PAYLOAD,
			ProtocolError::ServerOnly(_) => codes::UNSUPPORTED_TYPE,
			ProtocolError::BinaryFrame => codes::UNSUPPORTED_FRAME,
		}
	}

	/// The `error` envelope reported back to the offending sender.
	pub fn to_envelope(&self) -> Envelope {
		Envelope::error(self.code(), self.to_string())
	}
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	payload: Option<serde_json::Value>,
	#[serde(default)]
	timestamp: Option<DateTime<Utc>>,
}

/// Decode one text frame into a typed, validated envelope.
///
/// The payload is checked against the declared `type` here, so routing never sees a shape mismatch.
/// Unknown payload fields are ignored; unknown types are rejected. A missing `timestamp` is filled
/// with the receive time.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
	let raw: RawEnvelope = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

	let kind = MessageType::from_wire(&raw.kind).ok_or_else(|| ProtocolError::UnknownType(raw.kind.clone()))?;

	let payload = match kind {
		MessageType::RoomMessage => Payload::RoomMessage(body(kind, raw.payload)?),
		MessageType::DirectMessage => Payload::DirectMessage(body(kind, raw.payload)?),
		MessageType::JoinRoom => Payload::JoinRoom(body(kind, raw.payload)?),
		MessageType::LeaveRoom => Payload::LeaveRoom(body(kind, raw.payload)?),
		MessageType::UserTyping => Payload::UserTyping(body(kind, raw.payload)?),
		MessageType::LoadRoomHistory => Payload::LoadRoomHistory(body(kind, raw.payload)?),
		MessageType::LoadConversation => Payload::LoadConversation(body(kind, raw.payload)?),
		MessageType::UserOnline => Payload::UserOnline(body(kind, raw.payload)?),
		MessageType::UserOffline => Payload::UserOffline(body(kind, raw.payload)?),
		MessageType::Ping => Payload::Ping,
		MessageType::Pong => Payload::Pong,
		MessageType::Error => Payload::Error(body(kind, raw.payload)?),
		MessageType::Success => Payload::Success(body(kind, raw.payload)?),
	};

	validate(&payload)?;

	Ok(Envelope {
		payload,
		timestamp: raw.timestamp.unwrap_or_else(Utc::now),
	})
}

/// Encode an envelope as a JSON text frame.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
	serde_json::to_string(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn body<T: DeserializeOwned>(kind: MessageType, value: Option<serde_json::Value>) -> Result<T, ProtocolError> {
	let value = match value {
		Some(serde_json::Value::Null) | None => return Err(ProtocolError::MissingPayload(kind)),
		Some(v) => v,
	};

	serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
		kind,
		reason: e.to_string(),
	})
}

fn invalid(kind: MessageType, reason: &str) -> ProtocolError {
	ProtocolError::InvalidPayload {
		kind,
		reason: reason.to_string(),
	}
}

fn ensure_positive(kind: MessageType, field: &str, raw: i64) -> Result<(), ProtocolError> {
	if raw <= 0 {
		return Err(invalid(kind, &format!("{field} must be positive")));
	}
	Ok(())
}

fn ensure_content(kind: MessageType, content: &str) -> Result<(), ProtocolError> {
	if content.trim().is_empty() {
		return Err(invalid(kind, "content must not be empty"));
	}
	Ok(())
}

fn validate_typing(kind: MessageType, t: &Typing) -> Result<(), ProtocolError> {
	match (t.room_id, t.to_user_id) {
		(Some(room), None) => ensure_positive(kind, "room_id", room.get()),
		(None, Some(user)) => ensure_positive(kind, "to_user_id", user.get()),
		_ => Err(invalid(kind, "exactly one of room_id or to_user_id is required")),
	}
}

fn validate_history(kind: MessageType, page: &HistoryPage) -> Result<(), ProtocolError> {
	match kind {
		MessageType::LoadRoomHistory => {
			let room = page.room_id.ok_or_else(|| invalid(kind, "room_id is required"))?;
			ensure_positive(kind, "room_id", room.get())?;
			if page.conversation_id.is_some() {
				return Err(invalid(kind, "conversation_id is not allowed here"));
			}
		}
		_ => {
			let conversation = page
				.conversation_id
				.ok_or_else(|| invalid(kind, "conversation_id is required"))?;
			ensure_positive(kind, "conversation_id", conversation.get())?;
			if page.room_id.is_some() {
				return Err(invalid(kind, "room_id is not allowed here"));
			}
		}
	}

	if let Some(before) = page.before_id {
		ensure_positive(kind, "before_id", before.get())?;
	}
	Ok(())
}

fn validate(payload: &Payload) -> Result<(), ProtocolError> {
	let kind = payload.message_type();
	match payload {
		Payload::RoomMessage(m) => {
			ensure_positive(kind, "room_id", m.room_id.get())?;
			ensure_content(kind, &m.content)
		}
		Payload::DirectMessage(m) => {
			ensure_positive(kind, "to_user_id", m.to_user_id.get())?;
			ensure_content(kind, &m.content)
		}
		Payload::JoinRoom(r) | Payload::LeaveRoom(r) => ensure_positive(kind, "room_id", r.room_id.get()),
		Payload::UserTyping(t) => validate_typing(kind, t),
		Payload::LoadRoomHistory(p) | Payload::LoadConversation(p) => validate_history(kind, p),
		Payload::Error(e) if e.code.trim().is_empty() => Err(invalid(kind, "code must not be empty")),
		_ => Ok(()),
	}
}
