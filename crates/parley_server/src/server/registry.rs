#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_domain::{ConnectionId, Identity, RoomId, UserId};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::server::lifecycle::Lifecycle;

/// What the hub keeps for one live socket: identity, outbound queue and lifecycle.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	pub id: ConnectionId,
	pub identity: Identity,
	outbound: mpsc::Sender<Utf8Bytes>,
	lifecycle: Arc<Lifecycle>,
}

impl ConnectionHandle {
	pub fn new(id: ConnectionId, identity: Identity, outbound: mpsc::Sender<Utf8Bytes>, lifecycle: Arc<Lifecycle>) -> Self {
		Self {
			id,
			identity,
			outbound,
			lifecycle,
		}
	}

	pub fn user_id(&self) -> UserId {
		self.identity.user_id
	}

	pub fn lifecycle(&self) -> &Arc<Lifecycle> {
		&self.lifecycle
	}

	/// Non-blocking enqueue of an encoded text frame.
	pub fn try_send(&self, frame: Utf8Bytes) -> Result<(), mpsc::error::TrySendError<Utf8Bytes>> {
		self.outbound.try_send(frame)
	}
}

/// Presence of an online user. Offline users have none; their `last_seen` travels in `user_offline` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
	pub username: String,
	pub connections: usize,
}

/// Result of removing a connection.
#[derive(Debug)]
pub struct Removed {
	pub handle: ConnectionHandle,
	pub rooms: Vec<RoomId>,
	/// Set when the user has no connections left.
	pub last_seen: Option<DateTime<Utc>>,
}

impl Removed {
	pub fn last_for_user(&self) -> bool {
		self.last_seen.is_some()
	}
}

#[derive(Debug)]
struct ConnectionEntry {
	handle: ConnectionHandle,
	rooms: HashSet<RoomId>,
}

/// Rooms and the user index. Owned and mutated by the hub task only.
///
/// Every map is keyed by live connections, so a user's entries disappear with their last connection.
#[derive(Debug, Default)]
pub struct Registry {
	connections: HashMap<ConnectionId, ConnectionEntry>,
	rooms: HashMap<RoomId, HashSet<ConnectionId>>,
	by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl Registry {
	/// Index a connection. Returns true when it is the user's first live connection.
	pub fn insert(&mut self, handle: ConnectionHandle) -> bool {
		let user = handle.user_id();
		let conn = handle.id;

		let conns = self.by_user.entry(user).or_default();
		let first = conns.is_empty();
		conns.insert(conn);

		self.connections.insert(
			conn,
			ConnectionEntry {
				handle,
				rooms: HashSet::new(),
			},
		);

		first
	}

	/// Drop a connection from every room and the user index. `None` if it was not registered.
	pub fn remove(&mut self, conn: ConnectionId) -> Option<Removed> {
		let entry = self.connections.remove(&conn)?;

		let mut rooms = Vec::with_capacity(entry.rooms.len());
		for room in entry.rooms {
			if let Some(members) = self.rooms.get_mut(&room) {
				members.remove(&conn);
				if members.is_empty() {
					self.rooms.remove(&room);
				}
			}
			rooms.push(room);
		}
		rooms.sort();

		let user = entry.handle.user_id();
		let mut last_seen = None;
		if let Some(conns) = self.by_user.get_mut(&user) {
			conns.remove(&conn);
			if conns.is_empty() {
				self.by_user.remove(&user);
				last_seen = Some(Utc::now());
			}
		}

		Some(Removed {
			handle: entry.handle,
			rooms,
			last_seen,
		})
	}

	/// Idempotent join. `None` when the connection is unknown, otherwise whether membership changed.
	pub fn join(&mut self, conn: ConnectionId, room: RoomId) -> Option<bool> {
		let entry = self.connections.get_mut(&conn)?;
		let added = entry.rooms.insert(room);
		if added {
			self.rooms.entry(room).or_default().insert(conn);
		}
		Some(added)
	}

	/// Leaving a room the connection is not in is a no-op.
	pub fn leave(&mut self, conn: ConnectionId, room: RoomId) -> bool {
		let Some(entry) = self.connections.get_mut(&conn) else {
			return false;
		};
		if !entry.rooms.remove(&room) {
			return false;
		}
		if let Some(members) = self.rooms.get_mut(&room) {
			members.remove(&conn);
			if members.is_empty() {
				self.rooms.remove(&room);
			}
		}
		true
	}

	pub fn is_member(&self, conn: ConnectionId, room: RoomId) -> bool {
		self.rooms.get(&room).is_some_and(|m| m.contains(&conn))
	}

	pub fn handle(&self, conn: ConnectionId) -> Option<&ConnectionHandle> {
		self.connections.get(&conn).map(|e| &e.handle)
	}

	/// Snapshot of a room's members, ordered by connection id.
	pub fn members(&self, room: RoomId) -> Vec<ConnectionId> {
		let mut out: Vec<ConnectionId> = self
			.rooms
			.get(&room)
			.map(|m| m.iter().copied().collect())
			.unwrap_or_default();
		out.sort();
		out
	}

	pub fn user_connections(&self, user: UserId) -> Vec<ConnectionId> {
		let mut out: Vec<ConnectionId> = self
			.by_user
			.get(&user)
			.map(|c| c.iter().copied().collect())
			.unwrap_or_default();
		out.sort();
		out
	}

	pub fn is_online(&self, user: UserId) -> bool {
		self.by_user.contains_key(&user)
	}

	pub fn presence(&self, user: UserId) -> Option<Presence> {
		let conns = self.by_user.get(&user)?;
		let username = self.username_of(conns)?;
		Some(Presence {
			username,
			connections: conns.len(),
		})
	}

	/// Online users other than `except`, ordered by user id.
	pub fn online_users(&self, except: UserId) -> Vec<(UserId, String)> {
		let mut out: Vec<(UserId, String)> = self
			.by_user
			.iter()
			.filter(|(u, _)| **u != except)
			.filter_map(|(u, conns)| self.username_of(conns).map(|name| (*u, name)))
			.collect();
		out.sort();
		out
	}

	pub fn online_user_count(&self) -> usize {
		self.by_user.len()
	}

	fn username_of(&self, conns: &HashSet<ConnectionId>) -> Option<String> {
		conns
			.iter()
			.find_map(|c| self.connections.get(c))
			.map(|e| e.handle.identity.username.clone())
	}

	pub fn all_connections(&self) -> Vec<ConnectionId> {
		let mut out: Vec<ConnectionId> = self.connections.keys().copied().collect();
		out.sort();
		out
	}

	/// Connections of other users sharing at least one room with any of `user`'s connections.
	pub fn co_members(&self, user: UserId) -> Vec<ConnectionId> {
		self.co_members_in(user, self.rooms_of_user(user))
	}

	/// Same as `co_members`, for an explicit set of rooms.
	pub fn co_members_in(&self, user: UserId, rooms: impl IntoIterator<Item = RoomId>) -> Vec<ConnectionId> {
		let mut out = HashSet::new();
		for room in rooms {
			let Some(members) = self.rooms.get(&room) else {
				continue;
			};
			for conn in members {
				if let Some(entry) = self.connections.get(conn)
					&& entry.handle.user_id() != user
				{
					out.insert(*conn);
				}
			}
		}
		let mut out: Vec<ConnectionId> = out.into_iter().collect();
		out.sort();
		out
	}

	/// Users (other than `user`) sharing a room with `user`, ordered by user id.
	pub fn co_member_users(&self, user: UserId) -> Vec<(UserId, String)> {
		let mut seen = HashSet::new();
		let mut out = Vec::new();
		for conn in self.co_members(user) {
			if let Some(entry) = self.connections.get(&conn) {
				let id = entry.handle.user_id();
				if seen.insert(id) {
					out.push((id, entry.handle.identity.username.clone()));
				}
			}
		}
		out.sort();
		out
	}

	fn rooms_of_user(&self, user: UserId) -> HashSet<RoomId> {
		let mut rooms = HashSet::new();
		if let Some(conns) = self.by_user.get(&user) {
			for conn in conns {
				if let Some(entry) = self.connections.get(conn) {
					rooms.extend(entry.rooms.iter().copied());
				}
			}
		}
		rooms
	}

	pub fn connection_count(&self) -> usize {
		self.connections.len()
	}

	pub fn room_count(&self) -> usize {
		self.rooms.len()
	}
}
