#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use parley_domain::{ConversationId, Identity, MessageId, ParticipantPair, RoomId, UserId};
use parley_protocol::HistoryMessage;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::info;

/// One persisted message, room or direct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub room_id: Option<RoomId>,
	pub conversation_id: Option<ConversationId>,
	pub sender_id: UserId,
	pub sender_username: String,
	pub content: String,
	pub created_at: DateTime<Utc>,
}

impl StoredMessage {
	pub fn to_history(&self) -> HistoryMessage {
		HistoryMessage {
			message_id: self.id,
			room_id: self.room_id,
			conversation_id: self.conversation_id,
			sender_id: self.sender_id,
			sender_username: self.sender_username.clone(),
			content: self.content.clone(),
			created_at: self.created_at,
		}
	}
}

/// Durable writes. Ids are assigned here, before anything is broadcast.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	async fn persist_room_message(&self, room: RoomId, sender: &Identity, content: &str) -> anyhow::Result<MessageId>;

	/// Creates the conversation for the pair on first use; both orderings map to the same id.
	async fn persist_direct_message(
		&self,
		from: &Identity,
		to: UserId,
		content: &str,
	) -> anyhow::Result<(ConversationId, MessageId)>;
}

/// Paginated reads. Pages hold ids `< before` (when given), newest first, at most `limit` entries.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
	async fn fetch_room_history(
		&self,
		room: RoomId,
		before: Option<MessageId>,
		limit: u32,
	) -> anyhow::Result<Vec<StoredMessage>>;

	/// `None` when the conversation does not exist or `viewer` is not a participant.
	async fn fetch_conversation(
		&self,
		conversation: ConversationId,
		viewer: UserId,
		before: Option<MessageId>,
		limit: u32,
	) -> anyhow::Result<Option<Vec<StoredMessage>>>;
}

/// Both halves, as handed to the router.
#[derive(Clone)]
pub struct Stores {
	pub messages: Arc<dyn MessageStore>,
	pub history: Arc<dyn HistoryStore>,
}

impl Stores {
	pub fn in_memory() -> Self {
		let store = Arc::new(InMemoryStore::default());
		Self {
			messages: store.clone(),
			history: store,
		}
	}

	/// Pick a backend from the `database_url` scheme (`sqlite:` or `postgres:`).
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let store = Arc::new(SqlStore::connect(database_url).await?);
		Ok(Self {
			messages: store.clone(),
			history: store,
		})
	}
}

#[derive(Debug, Default)]
struct MemoryState {
	next_message_id: i64,
	next_conversation_id: i64,
	messages: Vec<StoredMessage>,
	conversations: HashMap<ParticipantPair, ConversationId>,
	participants: HashMap<ConversationId, ParticipantPair>,
}

impl MemoryState {
	fn next_message(&mut self) -> MessageId {
		self.next_message_id += 1;
		MessageId(self.next_message_id)
	}

	fn conversation_for(&mut self, pair: ParticipantPair) -> ConversationId {
		if let Some(id) = self.conversations.get(&pair) {
			return *id;
		}
		self.next_conversation_id += 1;
		let id = ConversationId(self.next_conversation_id);
		self.conversations.insert(pair, id);
		self.participants.insert(id, pair);
		id
	}

	fn page(&self, matches: impl Fn(&StoredMessage) -> bool, before: Option<MessageId>, limit: u32) -> Vec<StoredMessage> {
		self.messages
			.iter()
			.rev()
			.filter(|m| matches(*m))
			.filter(|m| before.is_none_or(|b| m.id < b))
			.take(limit as usize)
			.cloned()
			.collect()
	}
}

/// Process-local store for development and tests. Ids are monotonic, so insertion order is id order.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<MemoryState>,
}

impl InMemoryStore {
	pub async fn message_count(&self) -> usize {
		self.inner.lock().await.messages.len()
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryStore {
	async fn persist_room_message(&self, room: RoomId, sender: &Identity, content: &str) -> anyhow::Result<MessageId> {
		let mut guard = self.inner.lock().await;
		let id = guard.next_message();
		guard.messages.push(StoredMessage {
			id,
			room_id: Some(room),
			conversation_id: None,
			sender_id: sender.user_id,
			sender_username: sender.username.clone(),
			content: content.to_string(),
			created_at: Utc::now(),
		});
		Ok(id)
	}

	async fn persist_direct_message(
		&self,
		from: &Identity,
		to: UserId,
		content: &str,
	) -> anyhow::Result<(ConversationId, MessageId)> {
		let mut guard = self.inner.lock().await;
		let conversation = guard.conversation_for(ParticipantPair::new(from.user_id, to));
		let id = guard.next_message();
		guard.messages.push(StoredMessage {
			id,
			room_id: None,
			conversation_id: Some(conversation),
			sender_id: from.user_id,
			sender_username: from.username.clone(),
			content: content.to_string(),
			created_at: Utc::now(),
		});
		Ok((conversation, id))
	}
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryStore {
	async fn fetch_room_history(
		&self,
		room: RoomId,
		before: Option<MessageId>,
		limit: u32,
	) -> anyhow::Result<Vec<StoredMessage>> {
		let guard = self.inner.lock().await;
		Ok(guard.page(|m| m.room_id == Some(room), before, limit))
	}

	async fn fetch_conversation(
		&self,
		conversation: ConversationId,
		viewer: UserId,
		before: Option<MessageId>,
		limit: u32,
	) -> anyhow::Result<Option<Vec<StoredMessage>>> {
		let guard = self.inner.lock().await;
		match guard.participants.get(&conversation) {
			Some(pair) if pair.contains(viewer) => {
				Ok(Some(guard.page(|m| m.conversation_id == Some(conversation), before, limit)))
			}
			_ => Ok(None),
		}
	}
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type MessageRow = (i64, Option<i64>, Option<i64>, i64, String, String, i64);

fn row_to_message(row: MessageRow) -> anyhow::Result<StoredMessage> {
	let (id, room_id, conversation_id, sender_id, sender_username, content, created_at_ms) = row;
	let created_at =
		DateTime::from_timestamp_millis(created_at_ms).ok_or_else(|| anyhow!("invalid created_at {created_at_ms}"))?;
	Ok(StoredMessage {
		id: MessageId(id),
		room_id: room_id.map(RoomId),
		conversation_id: conversation_id.map(ConversationId),
		sender_id: UserId(sender_id),
		sender_username,
		content,
		created_at,
	})
}

fn cursor(before: Option<MessageId>) -> i64 {
	before.map(MessageId::get).unwrap_or(i64::MAX)
}

/// `sqlx` store with embedded migrations.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			let mut pool_opts = SqlitePoolOptions::new();
			if database_url.contains(":memory:") {
				pool_opts = pool_opts.max_connections(1).idle_timeout(None).max_lifetime(None);
			}
			let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			info!("message store: sqlite ready");

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			info!("message store: postgres ready");

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url scheme (expected sqlite: or postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlStore {
	async fn persist_room_message(&self, room: RoomId, sender: &Identity, content: &str) -> anyhow::Result<MessageId> {
		let now = Utc::now().timestamp_millis();
		let (id,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO messages (room_id, sender_id, sender_username, content, created_at) \
				VALUES (?, ?, ?, ?, ?) RETURNING id",
			)
			.bind(room.get())
			.bind(sender.user_id.get())
			.bind(&sender.username)
			.bind(content)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert room message (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"INSERT INTO messages (room_id, sender_id, sender_username, content, created_at) \
				VALUES ($1, $2, $3, $4, $5) RETURNING id",
			)
			.bind(room.get())
			.bind(sender.user_id.get())
			.bind(&sender.username)
			.bind(content)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert room message (postgres)")?,
		};
		Ok(MessageId(id))
	}

	async fn persist_direct_message(
		&self,
		from: &Identity,
		to: UserId,
		content: &str,
	) -> anyhow::Result<(ConversationId, MessageId)> {
		let pair = ParticipantPair::new(from.user_id, to);
		let now = Utc::now().timestamp_millis();

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query(
					"INSERT INTO conversations (user_low, user_high, created_at) VALUES (?, ?, ?) \
					ON CONFLICT(user_low, user_high) DO NOTHING",
				)
				.bind(pair.low().get())
				.bind(pair.high().get())
				.bind(now)
				.execute(&mut *tx)
				.await
				.context("upsert conversation (sqlite)")?;

				let (conversation,): (i64,) =
					sqlx::query_as("SELECT id FROM conversations WHERE user_low = ? AND user_high = ?")
						.bind(pair.low().get())
						.bind(pair.high().get())
						.fetch_one(&mut *tx)
						.await
						.context("select conversation (sqlite)")?;

				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (conversation_id, sender_id, sender_username, content, created_at) \
					VALUES (?, ?, ?, ?, ?) RETURNING id",
				)
				.bind(conversation)
				.bind(from.user_id.get())
				.bind(&from.username)
				.bind(content)
				.bind(now)
				.fetch_one(&mut *tx)
				.await
				.context("insert direct message (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				Ok((ConversationId(conversation), MessageId(id)))
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				sqlx::query(
					"INSERT INTO conversations (user_low, user_high, created_at) VALUES ($1, $2, $3) \
					ON CONFLICT (user_low, user_high) DO NOTHING",
				)
				.bind(pair.low().get())
				.bind(pair.high().get())
				.bind(now)
				.execute(&mut *tx)
				.await
				.context("upsert conversation (postgres)")?;

				let (conversation,): (i64,) =
					sqlx::query_as("SELECT id FROM conversations WHERE user_low = $1 AND user_high = $2")
						.bind(pair.low().get())
						.bind(pair.high().get())
						.fetch_one(&mut *tx)
						.await
						.context("select conversation (postgres)")?;

				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (conversation_id, sender_id, sender_username, content, created_at) \
					VALUES ($1, $2, $3, $4, $5) RETURNING id",
				)
				.bind(conversation)
				.bind(from.user_id.get())
				.bind(&from.username)
				.bind(content)
				.bind(now)
				.fetch_one(&mut *tx)
				.await
				.context("insert direct message (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				Ok((ConversationId(conversation), MessageId(id)))
			}
		}
	}
}

#[async_trait::async_trait]
impl HistoryStore for SqlStore {
	async fn fetch_room_history(
		&self,
		room: RoomId,
		before: Option<MessageId>,
		limit: u32,
	) -> anyhow::Result<Vec<StoredMessage>> {
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, room_id, conversation_id, sender_id, sender_username, content, created_at \
				FROM messages WHERE room_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
			)
			.bind(room.get())
			.bind(cursor(before))
			.bind(i64::from(limit))
			.fetch_all(pool)
			.await
			.context("select room history (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, room_id, conversation_id, sender_id, sender_username, content, created_at \
				FROM messages WHERE room_id = $1 AND id < $2 ORDER BY id DESC LIMIT $3",
			)
			.bind(room.get())
			.bind(cursor(before))
			.bind(i64::from(limit))
			.fetch_all(pool)
			.await
			.context("select room history (postgres)")?,
		};
		rows.into_iter().map(row_to_message).collect()
	}

	async fn fetch_conversation(
		&self,
		conversation: ConversationId,
		viewer: UserId,
		before: Option<MessageId>,
		limit: u32,
	) -> anyhow::Result<Option<Vec<StoredMessage>>> {
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let participants: Option<(i64, i64)> = sqlx::query_as("SELECT user_low, user_high FROM conversations WHERE id = ?")
					.bind(conversation.get())
					.fetch_optional(pool)
					.await
					.context("select conversation participants (sqlite)")?;
				if !is_participant(participants, viewer) {
					return Ok(None);
				}
				let rows = sqlx::query_as(
					"SELECT id, room_id, conversation_id, sender_id, sender_username, content, created_at \
					FROM messages WHERE conversation_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
				)
				.bind(conversation.get())
				.bind(cursor(before))
				.bind(i64::from(limit))
				.fetch_all(pool)
				.await
				.context("select conversation history (sqlite)")?;
				rows
			}
			SqlBackend::Postgres(pool) => {
				let participants: Option<(i64, i64)> = sqlx::query_as("SELECT user_low, user_high FROM conversations WHERE id = $1")
					.bind(conversation.get())
					.fetch_optional(pool)
					.await
					.context("select conversation participants (postgres)")?;
				if !is_participant(participants, viewer) {
					return Ok(None);
				}
				let rows = sqlx::query_as(
					"SELECT id, room_id, conversation_id, sender_id, sender_username, content, created_at \
					FROM messages WHERE conversation_id = $1 AND id < $2 ORDER BY id DESC LIMIT $3",
				)
				.bind(conversation.get())
				.bind(cursor(before))
				.bind(i64::from(limit))
				.fetch_all(pool)
				.await
				.context("select conversation history (postgres)")?;
				rows
			}
		};
		rows.into_iter().map(row_to_message).collect::<anyhow::Result<Vec<_>>>().map(Some)
	}
}

fn is_participant(participants: Option<(i64, i64)>, viewer: UserId) -> bool {
	participants.is_some_and(|(low, high)| low == viewer.get() || high == viewer.get())
}
