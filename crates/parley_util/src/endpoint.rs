#![forbid(unsafe_code)]

//! Listen endpoints written as `ws://host:port[/path]`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
	#[error("endpoint must be non-empty (expected ws://host:port[/path])")]
	Empty,
	#[error("wss:// is not served here; terminate TLS in front and bind ws:// ({0})")]
	Tls(String),
	#[error("unsupported scheme (expected ws://host:port[/path]): {0}")]
	Scheme(String),
	#[error("invalid host (IPv6 must be bracketed like ws://[::1]:8080): {0}")]
	Host(String),
	#[error("invalid port (expected 1..=65535): {0}")]
	Port(String),
	#[error("the upgrade path may not carry a query or fragment: {0}")]
	Path(String),
}

/// Where the server listens and which request path it upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WsEndpoint {
	pub host: String,
	pub port: u16,
	/// `None` upgrades any path.
	pub path: Option<String>,
}

impl WsEndpoint {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
			path: None,
		}
	}

	/// `host:port` as handed to the socket bind; IPv6 stays bracketed.
	pub fn bind_addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Resolved address when the host is an IP literal.
	pub fn socket_addr(&self) -> Option<SocketAddr> {
		self.bind_addr().parse().ok()
	}

	/// Whether an upgrade request for `path` (query already stripped) is served.
	pub fn serves(&self, path: &str) -> bool {
		path_matches(self.path.as_deref(), path)
	}

	pub fn parse(s: &str) -> Result<Self, EndpointError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(EndpointError::Empty);
		}

		let rest = match s.split_once("://") {
			Some(("ws", rest)) => rest,
			Some(("wss", _)) => return Err(EndpointError::Tls(s.to_string())),
			_ => return Err(EndpointError::Scheme(s.to_string())),
		};

		let (authority, path) = match rest.find('/') {
			Some(i) => (&rest[..i], Some(&rest[i..])),
			None => (rest, None),
		};
		if authority.contains(['?', '#']) || path.is_some_and(|p| p.contains(['?', '#'])) {
			return Err(EndpointError::Path(s.to_string()));
		}

		let (host, port) = authority
			.rsplit_once(':')
			.ok_or_else(|| EndpointError::Port(s.to_string()))?;
		if host.is_empty() || (host.contains(':') && !(host.starts_with('[') && host.ends_with(']'))) {
			return Err(EndpointError::Host(s.to_string()));
		}
		let port = port
			.parse::<u16>()
			.ok()
			.filter(|p| *p > 0)
			.ok_or_else(|| EndpointError::Port(s.to_string()))?;

		// A bare trailing slash is the same as no path.
		let path = path.filter(|p| *p != "/").map(str::to_string);

		Ok(Self {
			host: host.to_string(),
			port,
			path,
		})
	}
}

/// Request path check shared by `WsEndpoint::serves` and the listener. Trailing slashes are ignored.
pub fn path_matches(expected: Option<&str>, path: &str) -> bool {
	match expected {
		None => true,
		Some(expected) => path.trim_end_matches('/') == expected.trim_end_matches('/'),
	}
}

impl FromStr for WsEndpoint {
	type Err = EndpointError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl fmt::Display for WsEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ws://{}:{}{}", self.host, self.port, self.path.as_deref().unwrap_or(""))
	}
}
