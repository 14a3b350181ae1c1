#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{ConnectionId, Identity, RoomId, UserId};
use tokio::sync::mpsc;

use crate::server::lifecycle::Lifecycle;
use crate::server::registry::{ConnectionHandle, Presence, Registry};

fn handle(conn: u64, user: i64, name: &str) -> ConnectionHandle {
	let (tx, _rx) = mpsc::channel(1);
	ConnectionHandle::new(
		ConnectionId(conn),
		Identity::new(UserId(user), name),
		tx,
		Arc::new(Lifecycle::new()),
	)
}

#[test]
fn first_and_last_connection_drive_presence() {
	let mut reg = Registry::default();

	assert!(reg.insert(handle(1, 10, "alice")));
	assert!(!reg.insert(handle(2, 10, "alice")));
	assert!(reg.is_online(UserId(10)));
	assert_eq!(reg.user_connections(UserId(10)), vec![ConnectionId(1), ConnectionId(2)]);
	assert_eq!(
		reg.presence(UserId(10)),
		Some(Presence {
			username: "alice".to_string(),
			connections: 2,
		})
	);

	let removed = reg.remove(ConnectionId(1)).expect("registered");
	assert!(!removed.last_for_user());
	assert_eq!(removed.last_seen, None);
	assert!(reg.is_online(UserId(10)));

	let removed = reg.remove(ConnectionId(2)).expect("registered");
	assert!(removed.last_for_user());
	assert!(removed.last_seen.is_some());
	assert!(!reg.is_online(UserId(10)));
	assert_eq!(reg.presence(UserId(10)), None);

	assert!(reg.remove(ConnectionId(2)).is_none());
	assert_eq!(reg.connection_count(), 0);
}

#[test]
fn departed_users_leave_nothing_behind() {
	let mut reg = Registry::default();
	reg.insert(handle(1, 1, "alice"));

	for user in 100..1100 {
		let conn = user as u64;
		assert!(reg.insert(handle(conn, user, "drifter")));
		reg.join(ConnectionId(conn), RoomId(user));
		assert!(reg.remove(ConnectionId(conn)).is_some_and(|r| r.last_for_user()));
	}

	assert_eq!(reg.online_user_count(), 1);
	assert_eq!(reg.connection_count(), 1);
	assert_eq!(reg.room_count(), 0);
	assert!(reg.presence(UserId(500)).is_none());
}

#[test]
fn reconnect_is_online_again() {
	let mut reg = Registry::default();
	reg.insert(handle(1, 10, "alice"));
	reg.remove(ConnectionId(1));
	assert!(reg.insert(handle(2, 10, "alice")));

	let presence = reg.presence(UserId(10)).expect("presence");
	assert_eq!(presence.connections, 1);
	assert_eq!(reg.online_users(UserId(99)), vec![(UserId(10), "alice".to_string())]);
}

#[test]
fn join_and_leave_are_idempotent() {
	let mut reg = Registry::default();
	reg.insert(handle(1, 10, "alice"));

	assert_eq!(reg.join(ConnectionId(1), RoomId(42)), Some(true));
	assert_eq!(reg.join(ConnectionId(1), RoomId(42)), Some(false));
	assert_eq!(reg.members(RoomId(42)), vec![ConnectionId(1)]);
	assert!(reg.is_member(ConnectionId(1), RoomId(42)));

	assert!(reg.leave(ConnectionId(1), RoomId(42)));
	assert!(!reg.leave(ConnectionId(1), RoomId(42)));
	assert!(!reg.is_member(ConnectionId(1), RoomId(42)));
}

#[test]
fn join_from_unknown_connection_is_refused() {
	let mut reg = Registry::default();
	assert_eq!(reg.join(ConnectionId(7), RoomId(1)), None);
	assert_eq!(reg.room_count(), 0);
}

#[test]
fn empty_rooms_are_collected() {
	let mut reg = Registry::default();
	reg.insert(handle(1, 10, "alice"));
	reg.insert(handle(2, 20, "bob"));
	reg.join(ConnectionId(1), RoomId(1));
	reg.join(ConnectionId(1), RoomId(2));
	reg.join(ConnectionId(2), RoomId(2));
	assert_eq!(reg.room_count(), 2);

	reg.leave(ConnectionId(2), RoomId(2));
	assert_eq!(reg.room_count(), 2);

	let removed = reg.remove(ConnectionId(1)).expect("registered");
	assert_eq!(removed.rooms, vec![RoomId(1), RoomId(2)]);
	assert_eq!(reg.room_count(), 0);
	assert!(reg.members(RoomId(1)).is_empty());
}

#[test]
fn co_members_exclude_the_user_and_strangers() {
	let mut reg = Registry::default();
	reg.insert(handle(1, 10, "alice"));
	reg.insert(handle(2, 10, "alice"));
	reg.insert(handle(3, 20, "bob"));
	reg.insert(handle(4, 30, "carol"));
	reg.join(ConnectionId(1), RoomId(5));
	reg.join(ConnectionId(2), RoomId(5));
	reg.join(ConnectionId(3), RoomId(5));
	reg.join(ConnectionId(4), RoomId(6));

	assert_eq!(reg.co_members(UserId(10)), vec![ConnectionId(3)]);
	assert_eq!(reg.co_member_users(UserId(20)), vec![(UserId(10), "alice".to_string())]);
	assert!(reg.co_members(UserId(30)).is_empty());
	assert_eq!(reg.co_members_in(UserId(30), [RoomId(5)]), vec![ConnectionId(1), ConnectionId(2), ConnectionId(3)]);
}

#[test]
fn online_users_lists_each_user_once() {
	let mut reg = Registry::default();
	reg.insert(handle(1, 10, "alice"));
	reg.insert(handle(2, 10, "alice"));
	reg.insert(handle(3, 20, "bob"));
	reg.insert(handle(4, 30, "carol"));
	reg.remove(ConnectionId(4));

	assert_eq!(reg.online_users(UserId(20)), vec![(UserId(10), "alice".to_string())]);
	assert_eq!(reg.all_connections(), vec![ConnectionId(1), ConnectionId(2), ConnectionId(3)]);
}
