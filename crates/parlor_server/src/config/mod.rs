#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

mod secret;

pub use secret::SecretString;

/// Default config path: `~/.parlor/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parlor").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_config() -> anyhow::Result<ParlorConfig> {
	let path = default_config_path()?;
	load_config_from_path(&path)
}

/// Same as `load_config` but with an explicit config path.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<ParlorConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ParlorConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ParlorConfig {
	pub auth: AuthSettings,
	pub server: ServerSettings,
	pub storage: StorageSettings,
}

/// Authentication settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// Bot token issued by the chat platform; the launch-data signing secret
	/// is derived from it. Required to serve.
	pub bot_token: Option<SecretString>,
	/// Launch-data field names carrying the identity claims.
	pub identity_fields: IdentityFieldNames,
}

/// Launch-data field names for identity claims.
///
/// Client revisions have shipped several namings for the same claims, so the
/// mapping is configuration rather than a fixed list.
#[derive(Debug, Clone)]
pub struct IdentityFieldNames {
	pub id: String,
	pub first_name: String,
	pub last_name: String,
	pub username: String,
	pub language: String,
}

impl Default for IdentityFieldNames {
	fn default() -> Self {
		Self {
			id: "user_id".to_string(),
			first_name: "user_first_name".to_string(),
			last_name: "user_last_name".to_string(),
			username: "username".to_string(),
			language: "language_code".to_string(),
		}
	}
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Storage settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
	/// Database URL (sqlite: or postgres:); in-memory store when unset.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	storage: FileStorageSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	bot_token: Option<String>,

	#[serde(default)]
	identity_fields: FileIdentityFieldNames,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileIdentityFieldNames {
	id: Option<String>,
	first_name: Option<String>,
	last_name: Option<String>,
	username: Option<String>,
	language: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStorageSettings {
	database_url: Option<String>,
}

impl ParlorConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = IdentityFieldNames::default();
		let identity_fields = IdentityFieldNames {
			id: file.auth.identity_fields.id.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.id),
			first_name: file
				.auth
				.identity_fields
				.first_name
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.first_name),
			last_name: file
				.auth
				.identity_fields
				.last_name
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.last_name),
			username: file
				.auth
				.identity_fields
				.username
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.username),
			language: file
				.auth
				.identity_fields
				.language
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.language),
		};

		Self {
			auth: AuthSettings {
				bot_token: file.auth.bot_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				identity_fields,
			},
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			storage: StorageSettings {
				database_url: file.storage.database_url.filter(|s| !s.trim().is_empty()),
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

fn apply_env_overrides(cfg: &mut ParlorConfig) {
	if let Ok(v) = std::env::var("PARLOR_BOT_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.bot_token = Some(SecretString::new(v));
			info!("auth config: bot_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLOR_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.storage.database_url = Some(v);
			info!("storage config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLOR_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}
}
