#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use parley_util::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::alerts::DEFAULT_RECENT_LIMIT;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub storage: StorageSettings,
	pub alerts: AlertsSettings,
}

/// Gateway settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for stateless access tokens; without it the gateway
	/// trusts the identity claimed in `Hello`.
	pub auth_hmac_secret: Option<SecretString>,
	/// Send rate limiting: per-connection burst size.
	pub send_rate_limit_per_conn_burst: u32,
	/// Send rate limiting: per-connection messages per minute.
	pub send_rate_limit_per_conn_per_minute: u32,
	/// Send rate limiting: per-channel burst size.
	pub send_rate_limit_per_channel_burst: u32,
	/// Send rate limiting: per-channel messages per minute.
	pub send_rate_limit_per_channel_per_minute: u32,
}

/// Message storage settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
	/// Persist messages and the social graph to SQL.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

/// Alert aggregation settings loaded by the server.
#[derive(Debug, Clone)]
pub struct AlertsSettings {
	/// Cap on recent unread messages and recent followers per bundle.
	pub recent_limit: usize,
}

impl Default for AlertsSettings {
	fn default() -> Self {
		Self {
			recent_limit: DEFAULT_RECENT_LIMIT,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	storage: FileStorageSettings,

	#[serde(default)]
	alerts: FileAlertsSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	send_rate_limit_per_conn_burst: Option<u32>,
	send_rate_limit_per_conn_per_minute: Option<u32>,
	send_rate_limit_per_channel_burst: Option<u32>,
	send_rate_limit_per_channel_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStorageSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAlertsSettings {
	recent_limit: Option<usize>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				send_rate_limit_per_conn_burst: file.server.send_rate_limit_per_conn_burst.unwrap_or(30),
				send_rate_limit_per_conn_per_minute: file.server.send_rate_limit_per_conn_per_minute.unwrap_or(300),
				send_rate_limit_per_channel_burst: file.server.send_rate_limit_per_channel_burst.unwrap_or(10),
				send_rate_limit_per_channel_per_minute: file.server.send_rate_limit_per_channel_per_minute.unwrap_or(120),
			},
			storage: StorageSettings {
				enabled: file.storage.enabled.unwrap_or(false),
				database_url: file.storage.database_url.filter(|s| !s.trim().is_empty()),
			},
			alerts: AlertsSettings {
				recent_limit: file.alerts.recent_limit.filter(|v| *v > 0).unwrap_or(DEFAULT_RECENT_LIMIT),
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
	if let Ok(v) = std::env::var("PARLEY_SERVER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_SERVER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_SERVER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_SEND_RATE_LIMIT_PER_CONN_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.send_rate_limit_per_conn_burst = burst;
		info!(burst, "server config: send_rate_limit_per_conn_burst overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_SEND_RATE_LIMIT_PER_CONN_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.send_rate_limit_per_conn_per_minute = rate;
		info!(rate, "server config: send_rate_limit_per_conn_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_SEND_RATE_LIMIT_PER_CHANNEL_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.send_rate_limit_per_channel_burst = burst;
		info!(burst, "server config: send_rate_limit_per_channel_burst overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_SEND_RATE_LIMIT_PER_CHANNEL_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.send_rate_limit_per_channel_per_minute = rate;
		info!(
			rate,
			"server config: send_rate_limit_per_channel_per_minute overridden by env"
		);
	}

	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_STORAGE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.storage.enabled = enabled;
		info!(enabled, "storage: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_STORAGE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.storage.database_url = Some(v);
			info!("storage: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_ALERTS_RECENT_LIMIT")
		&& let Ok(limit) = v.trim().parse::<usize>()
		&& limit > 0
	{
		cfg.alerts.recent_limit = limit;
		info!(limit, "alerts config: recent_limit overridden by env");
	}

	if cfg.server.auth_hmac_secret.is_none() {
		warn!("server auth: no HMAC secret configured; sessions authenticate by claimed id (dev mode)");
	}

	if cfg.storage.enabled && cfg.storage.database_url.is_none() {
		warn!("storage: enabled but no database_url; set storage.database_url or PARLEY_STORAGE_DATABASE_URL");
	}
}
