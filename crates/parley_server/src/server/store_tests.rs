#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{ConversationId, Identity, MessageId, RoomId, UserId};
use proptest::prelude::*;

use crate::server::store::{HistoryStore, InMemoryStore, MessageStore, SqlStore, Stores};

fn alice() -> Identity {
	Identity::new(UserId(1), "alice")
}

fn bob() -> Identity {
	Identity::new(UserId(2), "bob")
}

async fn sqlite() -> Stores {
	let store = Arc::new(SqlStore::connect("sqlite::memory:").await.expect("sqlite memory store"));
	Stores {
		messages: store.clone(),
		history: store,
	}
}

async fn exercise_room_history(stores: &Stores) {
	let mut ids = Vec::new();
	for i in 0..5 {
		let id = stores
			.messages
			.persist_room_message(RoomId(42), &alice(), &format!("m{i}"))
			.await
			.expect("persist");
		ids.push(id);
	}
	stores
		.messages
		.persist_room_message(RoomId(43), &bob(), "elsewhere")
		.await
		.expect("persist");

	assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids increase: {ids:?}");

	let page = stores.history.fetch_room_history(RoomId(42), None, 2).await.expect("fetch");
	let got: Vec<MessageId> = page.iter().map(|m| m.id).collect();
	assert_eq!(got, vec![ids[4], ids[3]]);
	assert_eq!(page[0].content, "m4");
	assert_eq!(page[0].sender_id, UserId(1));
	assert_eq!(page[0].sender_username, "alice");
	assert_eq!(page[0].room_id, Some(RoomId(42)));
	assert_eq!(page[0].conversation_id, None);

	let older = stores
		.history
		.fetch_room_history(RoomId(42), Some(ids[3]), 10)
		.await
		.expect("fetch");
	let got: Vec<MessageId> = older.iter().map(|m| m.id).collect();
	assert_eq!(got, vec![ids[2], ids[1], ids[0]]);

	let empty = stores
		.history
		.fetch_room_history(RoomId(42), Some(ids[0]), 10)
		.await
		.expect("fetch");
	assert!(empty.is_empty());

	let unknown = stores.history.fetch_room_history(RoomId(7), None, 10).await.expect("fetch");
	assert!(unknown.is_empty());
}

async fn exercise_conversations(stores: &Stores) {
	let (c1, m1) = stores
		.messages
		.persist_direct_message(&alice(), UserId(2), "hi bob")
		.await
		.expect("persist");
	let (c2, m2) = stores
		.messages
		.persist_direct_message(&bob(), UserId(1), "hi alice")
		.await
		.expect("persist");
	assert_eq!(c1, c2, "both orderings share one conversation");
	assert!(m1 < m2);

	let (c3, _) = stores
		.messages
		.persist_direct_message(&alice(), UserId(3), "hi carol")
		.await
		.expect("persist");
	assert_ne!(c1, c3);

	let page = stores
		.history
		.fetch_conversation(c1, UserId(2), None, 10)
		.await
		.expect("fetch")
		.expect("bob is a participant");
	let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
	assert_eq!(contents, vec!["hi alice", "hi bob"]);
	assert!(page.iter().all(|m| m.conversation_id == Some(c1) && m.room_id.is_none()));

	let older = stores
		.history
		.fetch_conversation(c1, UserId(1), Some(m2), 10)
		.await
		.expect("fetch")
		.expect("alice is a participant");
	assert_eq!(older.len(), 1);
	assert_eq!(older[0].id, m1);

	assert!(
		stores
			.history
			.fetch_conversation(c1, UserId(3), None, 10)
			.await
			.expect("fetch")
			.is_none()
	);
	assert!(
		stores
			.history
			.fetch_conversation(ConversationId(9999), UserId(1), None, 10)
			.await
			.expect("fetch")
			.is_none()
	);
}

#[tokio::test]
async fn in_memory_room_history() {
	exercise_room_history(&Stores::in_memory()).await;
}

#[tokio::test]
async fn in_memory_conversations() {
	exercise_conversations(&Stores::in_memory()).await;
}

#[tokio::test]
async fn sqlite_room_history() {
	exercise_room_history(&sqlite().await).await;
}

#[tokio::test]
async fn sqlite_conversations() {
	exercise_conversations(&sqlite().await).await;
}

#[tokio::test]
async fn unsupported_database_scheme_is_rejected() {
	let err = SqlStore::connect("mysql://localhost/db").await.err().expect("rejected");
	assert!(err.to_string().contains("unsupported"), "{err:#}");
}

#[tokio::test]
async fn sqlite_keeps_created_at_to_the_millisecond() {
	let stores = sqlite().await;
	let before = chrono::Utc::now().timestamp_millis();
	stores
		.messages
		.persist_room_message(RoomId(1), &alice(), "x")
		.await
		.expect("persist");
	let after = chrono::Utc::now().timestamp_millis();

	let page = stores.history.fetch_room_history(RoomId(1), None, 1).await.expect("fetch");
	let at = page[0].created_at.timestamp_millis();
	assert!(before <= at && at <= after);
}

proptest! {
	#[test]
	fn walking_pages_visits_every_message_once(count in 0usize..40, limit in 1u32..8) {
		let rt = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
		let walked = rt.block_on(async {
			let store = InMemoryStore::default();
			for i in 0..count {
				store
					.persist_room_message(RoomId(1), &alice(), &i.to_string())
					.await
					.expect("persist");
			}

			let mut walked = Vec::new();
			let mut before = None;
			loop {
				let page = store.fetch_room_history(RoomId(1), before, limit).await.expect("fetch");
				let Some(last) = page.last() else { break };
				before = Some(last.id);
				walked.extend(page.iter().map(|m| m.id.get()));
			}
			walked
		});

		let expected: Vec<i64> = (1..=count as i64).rev().collect();
		prop_assert_eq!(walked, expected);
	}
}
