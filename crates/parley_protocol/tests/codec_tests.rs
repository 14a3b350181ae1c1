use parley_domain::{ConversationId, MessageId, RoomId, UserId};
use parley_protocol::{
	Ack, DirectMessage, Envelope, HistoryPage, MessageType, Payload, ProtocolError, RoomMessage, codes, decode, encode,
};
use proptest::prelude::*;

#[test]
fn stamped_room_message_encodes_all_fields() {
	let env = Envelope::new(Payload::RoomMessage(RoomMessage {
		room_id: RoomId(42),
		content: "hi".to_string(),
		sender_id: Some(UserId(1)),
		sender_username: Some("alice".to_string()),
		message_id: Some(MessageId(900)),
	}));

	let text = encode(&env).expect("encode");
	let value: serde_json::Value = serde_json::from_str(&text).expect("json");

	assert_eq!(value["type"], "room_message");
	assert_eq!(value["payload"]["room_id"], 42);
	assert_eq!(value["payload"]["content"], "hi");
	assert_eq!(value["payload"]["sender_id"], 1);
	assert_eq!(value["payload"]["sender_username"], "alice");
	assert_eq!(value["payload"]["message_id"], 900);

	let back = decode(&text).expect("decode");
	assert_eq!(back.payload, env.payload);
}

#[test]
fn unstamped_direct_message_omits_server_fields() {
	let env = Envelope::new(Payload::DirectMessage(DirectMessage {
		to_user_id: UserId(2),
		content: "hey".to_string(),
		from_user_id: None,
		from_username: None,
		conversation_id: None,
		message_id: None,
	}));

	let value: serde_json::Value = serde_json::from_str(&encode(&env).expect("encode")).expect("json");
	let payload = value["payload"].as_object().expect("payload object");
	assert_eq!(payload.len(), 2);
	assert!(payload.contains_key("to_user_id"));
	assert!(payload.contains_key("content"));
}

#[test]
fn history_request_requires_matching_target() {
	let ok = decode(r#"{"type":"load_conversation","payload":{"conversation_id":5,"limit":20,"before_id":100}}"#)
		.expect("decode");
	match ok.payload {
		Payload::LoadConversation(page) => {
			assert_eq!(page.conversation_id, Some(ConversationId(5)));
			assert_eq!(page.before_id, Some(MessageId(100)));
			assert_eq!(page.limit, 20);
		}
		other => panic!("unexpected payload: {other:?}"),
	}

	let wrong = decode(r#"{"type":"load_room_history","payload":{"conversation_id":5,"limit":20}}"#).unwrap_err();
	assert_eq!(wrong.code(), codes::INVALID_PAYLOAD);
}

#[test]
fn history_page_without_limit_defaults_to_zero() {
	let env = decode(r#"{"type":"load_room_history","payload":{"room_id":3}}"#).expect("decode");
	match env.payload {
		Payload::LoadRoomHistory(HistoryPage { limit, before_id, .. }) => {
			assert_eq!(limit, 0);
			assert!(before_id.is_none());
		}
		other => panic!("unexpected payload: {other:?}"),
	}
}

#[test]
fn success_ack_carries_action_name() {
	let mut ack = Ack::new(MessageType::DirectMessage);
	ack.delivered = Some(false);
	ack.message_id = Some(MessageId(7));

	let value: serde_json::Value = serde_json::from_str(&encode(&Envelope::ack(ack)).expect("encode")).expect("json");
	assert_eq!(value["type"], "success");
	assert_eq!(value["payload"]["action"], "direct_message");
	assert_eq!(value["payload"]["delivered"], false);
	assert_eq!(value["payload"]["message_id"], 7);
}

#[test]
fn malformed_json_and_missing_payload_map_to_codes() {
	let malformed = decode("{not json").unwrap_err();
	assert_eq!(malformed.code(), codes::MALFORMED_ENVELOPE);

	let missing = decode(r#"{"type":"room_message"}"#).unwrap_err();
	assert_eq!(missing, ProtocolError::MissingPayload(MessageType::RoomMessage));
	assert_eq!(missing.code(), codes::INVALID_PAYLOAD);

	let null_payload = decode(r#"{"type":"join_room","payload":null}"#).unwrap_err();
	assert_eq!(null_payload, ProtocolError::MissingPayload(MessageType::JoinRoom));
}

#[test]
fn type_names_are_matched_exactly() {
	let padded = decode(r#"{"type":" join_room ","payload":{"room_id":1}}"#).unwrap_err();
	assert_eq!(padded, ProtocolError::UnknownType(" join_room ".to_string()));
	assert_eq!(padded.code(), codes::UNKNOWN_TYPE);

	let upper = decode(r#"{"type":"JOIN_ROOM","payload":{"room_id":1}}"#).unwrap_err();
	assert_eq!(upper.code(), codes::UNKNOWN_TYPE);
}

#[test]
fn error_envelope_for_protocol_error_is_decodable() {
	let err = ProtocolError::UnknownType("shout".to_string());
	let text = encode(&err.to_envelope()).expect("encode");
	match decode(&text).expect("decode").payload {
		Payload::Error(body) => {
			assert_eq!(body.code, codes::UNKNOWN_TYPE);
			assert!(body.message.contains("shout"));
		}
		other => panic!("unexpected payload: {other:?}"),
	}
}

#[test]
fn every_type_name_round_trips_through_from_wire() {
	for kind in MessageType::ALL {
		assert_eq!(MessageType::from_wire(kind.as_str()), Some(kind));
	}
}

proptest! {
	#[test]
	fn unknown_types_are_always_rejected(kind in "[a-z_]{1,24}") {
		prop_assume!(MessageType::from_wire(&kind).is_none());
		let text = format!(r#"{{"type":"{kind}","payload":{{}}}}"#);
		let err = decode(&text).unwrap_err();
		prop_assert_eq!(err.code(), codes::UNKNOWN_TYPE);
	}

	#[test]
	fn arbitrary_text_never_panics(text in ".{0,256}") {
		let _ = decode(&text);
	}

	#[test]
	fn room_ids_survive_encoding(room in 1i64..i64::MAX, content in "[a-zA-Z0-9 ]{0,40}[a-zA-Z0-9]") {
		let env = Envelope::new(Payload::RoomMessage(RoomMessage {
			room_id: RoomId(room),
			content: content.clone(),
			sender_id: None,
			sender_username: None,
			message_id: None,
		}));
		let back = decode(&encode(&env).unwrap()).unwrap();
		prop_assert_eq!(back.payload, env.payload);
	}
}
