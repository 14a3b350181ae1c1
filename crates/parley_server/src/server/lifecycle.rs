#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
	Connecting = 0,
	Authenticated = 1,
	Active = 2,
	Closing = 3,
	Closed = 4,
}

impl ConnState {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => ConnState::Connecting,
			1 => ConnState::Authenticated,
			2 => ConnState::Active,
			3 => ConnState::Closing,
			_ => ConnState::Closed,
		}
	}
}

/// Why a connection is going away. Decides the close frame sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	ClientClosed,
	Transport,
	KeepaliveTimeout,
	WriteTimeout,
	SlowConsumer,
	ServerShutdown,
	RegistrationFailed,
}

impl CloseReason {
	/// WebSocket close code.
	pub const fn code(self) -> u16 {
		match self {
			CloseReason::SlowConsumer => 1008,
			CloseReason::ServerShutdown => 1001,
			CloseReason::RegistrationFailed => 1011,
			_ => 1000,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			CloseReason::ClientClosed => "client closed",
			CloseReason::Transport => "transport error",
			CloseReason::KeepaliveTimeout => "keepalive timeout",
			CloseReason::WriteTimeout => "write timeout",
			CloseReason::SlowConsumer => "slow consumer",
			CloseReason::ServerShutdown => "server shutting down",
			CloseReason::RegistrationFailed => "registration failed",
		}
	}
}

/// Shared between the inbound loop, the outbound loop and the hub.
///
/// Holds the state machine and the one-shot close signal. The first `close` wins; later calls are no-ops.
#[derive(Debug)]
pub struct Lifecycle {
	state: AtomicU8,
	close_tx: watch::Sender<Option<CloseReason>>,
}

impl Default for Lifecycle {
	fn default() -> Self {
		Self::new()
	}
}

impl Lifecycle {
	pub fn new() -> Self {
		let (close_tx, _) = watch::channel(None);
		Self {
			state: AtomicU8::new(ConnState::Connecting as u8),
			close_tx,
		}
	}

	pub fn state(&self) -> ConnState {
		ConnState::from_u8(self.state.load(Ordering::Acquire))
	}

	pub fn is_active(&self) -> bool {
		self.state() == ConnState::Active
	}

	/// Guarded transition. Returns false when the current state is not `from`.
	pub fn transition(&self, from: ConnState, to: ConnState) -> bool {
		if (to as u8) <= (from as u8) {
			return false;
		}
		self.state
			.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Move to `Closing` from any earlier state.
	pub fn begin_closing(&self) -> bool {
		let mut current = self.state.load(Ordering::Acquire);
		loop {
			if current >= ConnState::Closing as u8 {
				return false;
			}
			match self.state.compare_exchange(
				current,
				ConnState::Closing as u8,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => return true,
				Err(actual) => current = actual,
			}
		}
	}

	/// Both loops have exited and the socket is released.
	pub fn finish(&self) {
		self.begin_closing();
		self.state.store(ConnState::Closed as u8, Ordering::Release);
	}

	/// Fire the close signal. Returns true only for the first caller.
	pub fn close(&self, reason: CloseReason) -> bool {
		let fired = self.close_tx.send_if_modified(|current| {
			if current.is_some() {
				return false;
			}
			*current = Some(reason);
			true
		});
		if fired {
			self.begin_closing();
		}
		fired
	}

	pub fn close_reason(&self) -> Option<CloseReason> {
		*self.close_tx.borrow()
	}

	/// Resolves once `close` has been called.
	pub async fn closed(&self) -> CloseReason {
		let mut rx = self.close_tx.subscribe();
		let reason = rx.wait_for(|r| r.is_some()).await.ok().and_then(|r| *r);
		reason.unwrap_or(CloseReason::Transport)
	}
}
