#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use crate::server::ai::AiConfig;
use crate::server::connection::ConnectionSettings;
use crate::server::core::CoreConfig;
use crate::server::history::HistoryConfig;
use crate::server::ingest::IngestConfig;
use crate::server::janitor::JanitorConfig;
use crate::server::rate_limit::RateLimitConfig;
use crate::server::room_hub::RoomHubConfig;
use crate::server::rooms::RoomDirectoryConfig;
use crate::server::sessions::ConnectionRegistryConfig;
use crate::util::secret::SecretString;

/// Default config path: `~/.huddle/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".huddle").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub limits: LimitSettings,
	pub ai: AiSettings,
	pub janitor: JanitorSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Identity of this instance on the bus; random when unset.
	pub instance_id: Option<String>,
	/// HMAC secret for bearer tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Grace period for in-flight work at shutdown.
	pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct LimitSettings {
	/// Operations per user per 60 s window.
	pub rate_max_per_window: u32,
	/// Window between duplicate_login and forced close.
	pub preempt_window: Duration,
	pub connection_capacity: usize,
	pub current_room_capacity: usize,
	pub stream_capacity: usize,
	pub inflight_capacity: usize,
	pub rate_fallback_capacity: usize,
	pub history_page_limit: usize,
}

#[derive(Debug, Clone)]
pub struct AiSettings {
	/// Model tags recognised in mentions.
	pub models: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct JanitorSettings {
	pub interval: Duration,
	pub soft_rss_bytes: Option<u64>,
	pub hard_rss_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Use the sqlx store instead of the in-memory one.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

impl ServerConfig {
	/// Map the flat settings onto the component configs.
	pub fn core_config(&self) -> CoreConfig {
		CoreConfig {
			instance_id: self
				.server
				.instance_id
				.clone()
				.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
			auth_secret: self
				.server
				.auth_hmac_secret
				.clone()
				.unwrap_or_else(|| SecretString::new("insecure-dev-secret")),
			rate: RateLimitConfig {
				max_per_window: self.limits.rate_max_per_window,
				fallback_capacity: self.limits.rate_fallback_capacity,
			},
			connections: ConnectionRegistryConfig {
				capacity: self.limits.connection_capacity,
				preempt_window: self.limits.preempt_window,
			},
			rooms: RoomDirectoryConfig {
				current_room_capacity: self.limits.current_room_capacity,
			},
			history: HistoryConfig {
				page_limit: self.limits.history_page_limit,
				inflight_capacity: self.limits.inflight_capacity,
				..HistoryConfig::default()
			},
			ingest: IngestConfig {
				ai_models: self.ai.models.clone(),
			},
			ai: AiConfig {
				stream_capacity: self.limits.stream_capacity,
				..AiConfig::default()
			},
			hub: RoomHubConfig::default(),
		}
	}

	pub fn janitor_config(&self) -> JanitorConfig {
		JanitorConfig {
			interval: self.janitor.interval,
			soft_rss_bytes: self.janitor.soft_rss_bytes,
			hard_rss_bytes: self.janitor.hard_rss_bytes,
			..JanitorConfig::default()
		}
	}

	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings::default()
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	limits: FileLimitSettings,

	#[serde(default)]
	ai: FileAiSettings,

	#[serde(default)]
	janitor: FileJanitorSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	instance_id: Option<String>,
	auth_hmac_secret: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	rate_max_per_window: Option<u32>,
	preempt_window_secs: Option<u64>,
	connection_capacity: Option<usize>,
	current_room_capacity: Option<usize>,
	stream_capacity: Option<usize>,
	inflight_capacity: Option<usize>,
	rate_fallback_capacity: Option<usize>,
	history_page_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAiSettings {
	#[serde(default)]
	models: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileJanitorSettings {
	interval_secs: Option<u64>,
	soft_rss_mb: Option<u64>,
	hard_rss_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let models = if file.ai.models.is_empty() {
			vec!["wayneAI".to_string(), "consultingAI".to_string()]
		} else {
			file.ai.models
		};

		Self {
			server: ServerSettings {
				instance_id: file.server.instance_id.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				shutdown_grace: Duration::from_secs(file.server.shutdown_grace_secs.unwrap_or(5)),
			},
			limits: LimitSettings {
				rate_max_per_window: file.limits.rate_max_per_window.unwrap_or(40),
				preempt_window: Duration::from_secs(file.limits.preempt_window_secs.unwrap_or(8)),
				connection_capacity: file.limits.connection_capacity.unwrap_or(2_000),
				current_room_capacity: file.limits.current_room_capacity.unwrap_or(2_000),
				stream_capacity: file.limits.stream_capacity.unwrap_or(500),
				inflight_capacity: file.limits.inflight_capacity.unwrap_or(1_000),
				rate_fallback_capacity: file.limits.rate_fallback_capacity.unwrap_or(2_000),
				history_page_limit: file.limits.history_page_limit.unwrap_or(25),
			},
			ai: AiSettings { models },
			janitor: JanitorSettings {
				interval: Duration::from_secs(file.janitor.interval_secs.unwrap_or(180)),
				soft_rss_bytes: file.janitor.soft_rss_mb.map(|mb| mb * 1024 * 1024).or(Some(512 * 1024 * 1024)),
				hard_rss_bytes: file.janitor.hard_rss_mb.map(|mb| mb * 1024 * 1024).or(Some(1024 * 1024 * 1024)),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
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
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("HUDDLE_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_INSTANCE_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.instance_id = Some(v);
			info!("server config: instance_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_RATE_MAX_PER_WINDOW")
		&& let Ok(max) = v.trim().parse::<u32>()
	{
		cfg.limits.rate_max_per_window = max;
		info!(max, "server config: rate_max_per_window overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_PREEMPT_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.limits.preempt_window = Duration::from_secs(secs);
		info!(secs, "server config: preempt_window overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_AI_MODELS") {
		let models: Vec<String> = v
			.split(',')
			.map(|m| m.trim().to_string())
			.filter(|m| !m.is_empty())
			.collect();
		if !models.is_empty() {
			cfg.ai.models = models;
			info!("ai config: models overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}
