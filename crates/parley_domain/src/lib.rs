#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("identifier must be positive, got {0}")]
	NotPositive(i64),
}

macro_rules! int_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub i64);

		impl $name {
			/// Create an id, rejecting zero and negative values.
			pub fn new(raw: i64) -> Result<Self, ParseIdError> {
				if raw <= 0 {
					return Err(ParseIdError::NotPositive(raw));
				}
				Ok(Self(raw))
			}

			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				let raw = s.parse::<i64>().map_err(|e| ParseIdError::InvalidFormat(e.to_string()))?;
				Self::new(raw)
			}
		}

		impl From<$name> for i64 {
			fn from(id: $name) -> i64 {
				id.0
			}
		}
	};
}

int_id!(
	/// Registered user identifier, as issued by the account store.
	UserId
);

int_id!(
	/// Chat room identifier.
	RoomId
);

int_id!(
	/// Durable direct-conversation identifier assigned by persistence.
	ConversationId
);

int_id!(
	/// Persisted message identifier. Monotonic per store; used as the history cursor.
	MessageId
);

/// Server-local identifier for one live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Verified identity bound to a connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
	pub user_id: UserId,
	pub username: String,
}

impl Identity {
	pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
		Self {
			user_id,
			username: username.into(),
		}
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.username, self.user_id)
	}
}

/// Unordered pair of participants identifying a direct conversation before persistence assigns an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
	low: UserId,
	high: UserId,
}

impl ParticipantPair {
	pub fn new(a: UserId, b: UserId) -> Self {
		if a <= b { Self { low: a, high: b } } else { Self { low: b, high: a } }
	}

	pub fn low(&self) -> UserId {
		self.low
	}

	pub fn high(&self) -> UserId {
		self.high
	}

	pub fn contains(&self, user: UserId) -> bool {
		self.low == user || self.high == user
	}
}
