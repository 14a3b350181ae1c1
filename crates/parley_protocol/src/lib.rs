#![forbid(unsafe_code)]

pub mod codec;
pub mod envelope;

pub use codec::{ProtocolError, codes, decode, encode};
pub use envelope::{
	Ack, DirectMessage, Envelope, ErrorBody, HistoryMessage, HistoryPage, MessageType, Payload, PresenceEvent, RoomMessage,
	RoomRef, Typing,
};

/// Protocol version constants.
pub mod version {
	/// Value of the `Sec-WebSocket-Protocol` the server answers with when a client offers it.
	pub const SUBPROTOCOL: &str = "parley.v1";
}
