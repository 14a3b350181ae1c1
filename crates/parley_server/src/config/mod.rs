#![forbid(unsafe_code)]

use core::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_util::endpoint::WsEndpoint;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::auth::DEFAULT_ISSUER;
use crate::server::connection::ConnectionSettings;
use crate::server::hub::{HubConfig, PresenceScope};
use crate::server::router::RouterConfig;

/// Default bind endpoint.
pub const DEFAULT_BIND: &str = "ws://127.0.0.1:8080";

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Secret string that never prints its value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Server config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub bind: WsEndpoint,
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub connection: ConnectionSettings,
	pub hub: HubSettings,
	pub persistence: PersistenceSettings,
}

/// Side listeners.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Grace period for draining connections on shutdown.
	pub drain_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HS256 signing secret shared with the account service.
	pub jwt_secret: Option<SecretString>,
	/// Expected `iss` claim; empty disables the check.
	pub issuer: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HubSettings {
	pub hub: HubConfig,
	pub router: RouterConfig,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Use the database; otherwise messages live in process memory.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	bind: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	connection: FileConnectionSettings,

	#[serde(default)]
	hub: FileHubSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	jwt_secret: Option<String>,
	issuer: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConnectionSettings {
	max_message_size: Option<usize>,
	pong_wait_secs: Option<u64>,
	write_wait_secs: Option<u64>,
	outbound_queue_capacity: Option<usize>,
	max_coalesce: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	command_capacity: Option<usize>,
	presence_scope: Option<String>,
	history_default_limit: Option<u32>,
	history_max_limit: Option<u32>,
	max_content_len: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let bind = WsEndpoint::parse(file.bind.as_deref().unwrap_or(DEFAULT_BIND)).context("parse bind endpoint")?;

		let defaults = ConnectionSettings::default();
		let connection = ConnectionSettings {
			max_message_size: file
				.connection
				.max_message_size
				.filter(|v| *v > 0)
				.unwrap_or(defaults.max_message_size),
			pong_wait: file
				.connection
				.pong_wait_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.pong_wait),
			write_wait: file
				.connection
				.write_wait_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.write_wait),
			outbound_capacity: file
				.connection
				.outbound_queue_capacity
				.filter(|v| *v > 0)
				.unwrap_or(defaults.outbound_capacity),
			max_coalesce: file
				.connection
				.max_coalesce
				.filter(|v| *v > 0)
				.unwrap_or(defaults.max_coalesce),
		};

		let hub_defaults = HubConfig::default();
		let presence_scope = match file.hub.presence_scope.as_deref() {
			None => hub_defaults.presence_scope,
			Some(s) => PresenceScope::parse(s).ok_or_else(|| anyhow!("invalid hub.presence_scope {s:?} (expected global or rooms)"))?,
		};
		let router_defaults = RouterConfig::default();
		let mut router = RouterConfig {
			history_default_limit: file
				.hub
				.history_default_limit
				.filter(|v| *v > 0)
				.unwrap_or(router_defaults.history_default_limit),
			history_max_limit: file
				.hub
				.history_max_limit
				.filter(|v| *v > 0)
				.unwrap_or(router_defaults.history_max_limit),
			max_content_len: file
				.hub
				.max_content_len
				.filter(|v| *v > 0)
				.unwrap_or(router_defaults.max_content_len),
		};
		if router.history_default_limit > router.history_max_limit {
			warn!(
				default = router.history_default_limit,
				max = router.history_max_limit,
				"hub config: history_default_limit > history_max_limit; clamping"
			);
			router.history_default_limit = router.history_max_limit;
		}

		Ok(Self {
			bind,
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				drain_timeout: Duration::from_secs(file.server.drain_timeout_secs.unwrap_or(5)),
			},
			auth: AuthSettings {
				jwt_secret: file.auth.jwt_secret.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				issuer: match file.auth.issuer {
					Some(s) if s.trim().is_empty() => None,
					Some(s) => Some(s),
					None => Some(DEFAULT_ISSUER.to_string()),
				},
			},
			connection,
			hub: HubSettings {
				hub: HubConfig {
					command_capacity: file
						.hub
						.command_capacity
						.filter(|v| *v > 0)
						.unwrap_or(hub_defaults.command_capacity),
					presence_scope,
				},
				router,
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		})
	}
}

impl Default for ServerConfig {
	fn default() -> Self {
		// The built-in default endpoint always parses.
		Self::from_file(FileConfig::default()).unwrap_or_else(|_| Self {
			bind: WsEndpoint::new("127.0.0.1", 8080),
			server: ServerSettings::default(),
			auth: AuthSettings {
				jwt_secret: None,
				issuer: Some(DEFAULT_ISSUER.to_string()),
			},
			connection: ConnectionSettings::default(),
			hub: HubSettings::default(),
			persistence: PersistenceSettings::default(),
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("PARLEY_BIND") {
		match WsEndpoint::parse(&v) {
			Ok(bind) => {
				cfg.bind = bind;
				info!("server config: bind overridden by env");
			}
			Err(e) => warn!(error = %e, "server config: ignoring invalid PARLEY_BIND"),
		}
	} else if let Some(port) = env_string("PORT").and_then(|v| v.parse::<u16>().ok()).filter(|p| *p > 0) {
		cfg.bind.port = port;
		info!(port, "server config: port overridden by env");
	}

	if let Some(v) = env_string("PARLEY_JWT_SECRET").or_else(|| env_string("JWT_SECRET")) {
		cfg.auth.jwt_secret = Some(SecretString::new(v));
		info!("server auth: jwt_secret overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_JWT_ISSUER") {
		let v = v.trim().to_string();
		cfg.auth.issuer = if v.is_empty() { None } else { Some(v) };
		info!("server auth: issuer overridden by env");
	}

	if let Some(v) = env_string("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("PARLEY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(size) = env_string("PARLEY_MAX_MESSAGE_SIZE").and_then(|v| v.parse::<usize>().ok()).filter(|v| *v > 0) {
		cfg.connection.max_message_size = size;
		info!(size, "connection config: max_message_size overridden by env");
	}

	if let Some(secs) = env_string("PARLEY_PONG_WAIT_SECS").and_then(|v| v.parse::<u64>().ok()).filter(|v| *v > 0) {
		cfg.connection.pong_wait = Duration::from_secs(secs);
		info!(secs, "connection config: pong_wait overridden by env");
	}

	if let Some(secs) = env_string("PARLEY_WRITE_WAIT_SECS").and_then(|v| v.parse::<u64>().ok()).filter(|v| *v > 0) {
		cfg.connection.write_wait = Duration::from_secs(secs);
		info!(secs, "connection config: write_wait overridden by env");
	}

	if let Some(capacity) = env_string("PARLEY_OUTBOUND_QUEUE_CAPACITY")
		.and_then(|v| v.parse::<usize>().ok())
		.filter(|v| *v > 0)
	{
		cfg.connection.outbound_capacity = capacity;
		info!(capacity, "connection config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = env_string("PARLEY_PRESENCE_SCOPE") {
		match PresenceScope::parse(&v) {
			Some(scope) => {
				cfg.hub.hub.presence_scope = scope;
				info!(?scope, "hub config: presence_scope overridden by env");
			}
			None => warn!(value = %v, "hub config: ignoring invalid PARLEY_PRESENCE_SCOPE"),
		}
	}

	if let Ok(v) = std::env::var("PARLEY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_string("PARLEY_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.auth.jwt_secret.is_none() {
		warn!("server auth: no jwt_secret configured; every upgrade will be rejected");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = ServerConfig::from_file(parse_toml("").unwrap()).unwrap();
		assert_eq!(cfg.bind.bind_addr(), "127.0.0.1:8080");
		assert_eq!(cfg.bind.path, None);
		assert_eq!(cfg.connection.max_message_size, 512);
		assert_eq!(cfg.connection.pong_wait, Duration::from_secs(60));
		assert_eq!(cfg.connection.ping_period(), Duration::from_secs(54));
		assert_eq!(cfg.connection.outbound_capacity, 256);
		assert_eq!(cfg.hub.router.history_default_limit, 50);
		assert_eq!(cfg.hub.router.history_max_limit, 100);
		assert_eq!(cfg.hub.hub.presence_scope, PresenceScope::Global);
		assert_eq!(cfg.auth.issuer.as_deref(), Some(DEFAULT_ISSUER));
		assert!(!cfg.persistence.enabled);
	}

	#[test]
	fn sections_are_read() {
		let toml = r#"
bind = "ws://0.0.0.0:9000/ws"

[server]
health_bind = "127.0.0.1:9100"

[auth]
jwt_secret = "s3cret"
issuer = ""

[connection]
max_message_size = 4096
pong_wait_secs = 30
outbound_queue_capacity = 8

[hub]
presence_scope = "rooms"
history_default_limit = 500
history_max_limit = 200

[persistence]
enabled = true
database_url = "sqlite::memory:"
"#;
		let cfg = ServerConfig::from_file(parse_toml(toml).unwrap()).unwrap();
		assert_eq!(cfg.bind.port, 9000);
		assert_eq!(cfg.bind.path.as_deref(), Some("/ws"));
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9100"));
		assert_eq!(cfg.auth.jwt_secret.as_ref().map(SecretString::expose), Some("s3cret"));
		assert_eq!(cfg.auth.issuer, None);
		assert_eq!(cfg.connection.max_message_size, 4096);
		assert_eq!(cfg.connection.ping_period(), Duration::from_secs(27));
		assert_eq!(cfg.connection.outbound_capacity, 8);
		assert_eq!(cfg.hub.hub.presence_scope, PresenceScope::Rooms);
		assert_eq!(cfg.hub.router.history_default_limit, 200);
		assert!(cfg.persistence.enabled);
	}

	#[test]
	fn invalid_values_are_rejected() {
		assert!(ServerConfig::from_file(parse_toml(r#"bind = "http://x:1""#).unwrap()).is_err());
		assert!(ServerConfig::from_file(parse_toml(r#"bind = "wss://x:443/ws""#).unwrap()).is_err());
		assert!(ServerConfig::from_file(parse_toml("[hub]\npresence_scope = \"planet\"").unwrap()).is_err());
		assert!(parse_toml("bind = ").is_err());
	}

	#[test]
	fn secret_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert!(!format!("{s:?}").contains("hunter2"));
	}
}
