#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use plaza_domain::{ChatRoomKey, RegionKey};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::auth::DEFAULT_SESSION_TTL;
use crate::server::chat::DEFAULT_HISTORY_CAPACITY;
use crate::server::observer::DEFAULT_OBSERVER_TTL;

/// Default QUIC bind endpoint.
pub const DEFAULT_BIND: &str = "quic://127.0.0.1:18310";

/// Default config path: `~/.plaza/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".plaza").join("config.toml"))
}

/// Load the server config from TOML (missing file = defaults) and apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// String that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub world: WorldSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// `quic://host:port`. The `--bind` flag wins over this.
	pub bind: String,
	/// Name reported in `Welcome`.
	pub server_name: String,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for session tokens. Random per process when unset.
	pub auth_hmac_secret: Option<SecretString>,
	pub session_ttl: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			server_name: "plaza".to_string(),
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			session_ttl: DEFAULT_SESSION_TTL,
		}
	}
}

/// The single world served by this process and its actor tuning.
#[derive(Debug, Clone)]
pub struct WorldSettings {
	pub region: RegionKey,
	pub chat_room: ChatRoomKey,
	pub chat_history_capacity: usize,
	pub observer_ttl: Duration,
	/// Quiet period before an idle actor is dropped from its directory.
	pub actor_idle: Duration,
	/// Deadline for one actor call made on behalf of a request.
	pub call_timeout: Duration,
	pub mailbox_capacity: usize,
}

impl Default for WorldSettings {
	fn default() -> Self {
		Self {
			region: RegionKey(1),
			chat_room: ChatRoomKey(1),
			chat_history_capacity: DEFAULT_HISTORY_CAPACITY,
			observer_ttl: DEFAULT_OBSERVER_TTL,
			actor_idle: Duration::from_secs(300),
			call_timeout: Duration::from_millis(5000),
			mailbox_capacity: 1024,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:, postgres: or mysql:). In-memory identities when unset.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	world: FileWorldSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	server_name: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	session_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileWorldSettings {
	region_id: Option<u64>,
	chat_room_id: Option<u64>,
	chat_history_capacity: Option<usize>,
	observer_ttl_secs: Option<u64>,
	actor_idle_secs: Option<u64>,
	call_timeout_ms: Option<u64>,
	mailbox_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let world_defaults = WorldSettings::default();

		Self {
			server: ServerSettings {
				bind: non_blank(file.server.bind).unwrap_or(server_defaults.bind),
				server_name: non_blank(file.server.server_name).unwrap_or(server_defaults.server_name),
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
				auth_hmac_secret: non_blank(file.server.auth_hmac_secret).map(SecretString::new),
				session_ttl: file
					.server
					.session_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(server_defaults.session_ttl),
			},
			world: WorldSettings {
				region: file.world.region_id.map(RegionKey).unwrap_or(world_defaults.region),
				chat_room: file.world.chat_room_id.map(ChatRoomKey).unwrap_or(world_defaults.chat_room),
				chat_history_capacity: file
					.world
					.chat_history_capacity
					.filter(|v| *v > 0)
					.unwrap_or(world_defaults.chat_history_capacity),
				observer_ttl: file
					.world
					.observer_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(world_defaults.observer_ttl),
				actor_idle: file
					.world
					.actor_idle_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(world_defaults.actor_idle),
				call_timeout: file
					.world
					.call_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(world_defaults.call_timeout),
				mailbox_capacity: file
					.world
					.mailbox_capacity
					.filter(|v| *v > 0)
					.unwrap_or(world_defaults.mailbox_capacity),
			},
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
	let raw = env_string(name)?;
	match raw.parse::<T>() {
		Ok(v) => Some(v),
		Err(_) => {
			warn!(env = name, value = %raw, "ignoring unparsable env override");
			None
		}
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("PLAZA_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string("PLAZA_SERVER_NAME") {
		cfg.server.server_name = v;
		info!("server config: server_name overridden by env");
	}

	if let Some(v) = env_string("PLAZA_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = env_string("PLAZA_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = env_string("PLAZA_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("PLAZA_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env_string("PLAZA_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("PLAZA_SESSION_TTL_SECS").filter(|v| *v > 0) {
		cfg.server.session_ttl = Duration::from_secs(secs);
		info!(secs, "server auth: session_ttl overridden by env");
	}

	if let Some(id) = env_parse::<u64>("PLAZA_REGION_ID") {
		cfg.world.region = RegionKey(id);
		info!(id, "world config: region_id overridden by env");
	}

	if let Some(id) = env_parse::<u64>("PLAZA_CHAT_ROOM_ID") {
		cfg.world.chat_room = ChatRoomKey(id);
		info!(id, "world config: chat_room_id overridden by env");
	}

	if let Some(capacity) = env_parse::<usize>("PLAZA_CHAT_HISTORY_CAPACITY").filter(|v| *v > 0) {
		cfg.world.chat_history_capacity = capacity;
		info!(capacity, "world config: chat_history_capacity overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("PLAZA_OBSERVER_TTL_SECS").filter(|v| *v > 0) {
		cfg.world.observer_ttl = Duration::from_secs(secs);
		info!(secs, "world config: observer_ttl overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("PLAZA_ACTOR_IDLE_SECS").filter(|v| *v > 0) {
		cfg.world.actor_idle = Duration::from_secs(secs);
		info!(secs, "world config: actor_idle overridden by env");
	}

	if let Some(ms) = env_parse::<u64>("PLAZA_CALL_TIMEOUT_MS").filter(|v| *v > 0) {
		cfg.world.call_timeout = Duration::from_millis(ms);
		info!(ms, "world config: call_timeout overridden by env");
	}

	if let Some(capacity) = env_parse::<usize>("PLAZA_MAILBOX_CAPACITY").filter(|v| *v > 0) {
		cfg.world.mailbox_capacity = capacity;
		info!(capacity, "world config: mailbox_capacity overridden by env");
	}

	if let Some(v) = env_string("PLAZA_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if cfg.world.observer_ttl <= cfg.world.call_timeout {
		warn!(
			observer_ttl_secs = cfg.world.observer_ttl.as_secs(),
			call_timeout_ms = cfg.world.call_timeout.as_millis(),
			"world config: observer_ttl is not longer than call_timeout"
		);
	}
}

/// Parse `quic://host:port` into a socket address. The host must be an IP literal
/// (IPv6 bracketed, like `quic://[::1]:18310`).
pub fn parse_quic_bind(s: &str) -> Result<SocketAddr, String> {
	let s = s.trim();
	if s.is_empty() {
		return Err("endpoint must be non-empty (expected quic://host:port)".to_string());
	}

	let rest = s
		.strip_prefix("quic://")
		.ok_or_else(|| format!("invalid endpoint (expected quic://host:port): {s}"))?;

	if rest.contains('/') || rest.contains('?') || rest.contains('#') {
		return Err(format!(
			"invalid endpoint (expected quic://host:port without path/query/fragment): {s}"
		));
	}

	let (host, port) = rest
		.rsplit_once(':')
		.ok_or_else(|| format!("invalid endpoint (missing :port): {s}"))?;
	if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
		return Err(format!("invalid endpoint host (IPv6 must be bracketed): {s}"));
	}

	let port: u16 = port
		.trim()
		.parse()
		.ok()
		.filter(|p| *p != 0)
		.ok_or_else(|| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

	format!("{}:{port}", host.trim())
		.parse()
		.map_err(|_| format!("host must be an IP literal: {host}"))
}
