//! Server configuration.
//!
//! One TOML file holds every section; the repository sections are shared
//! with [`RepositoryConfig`] so the same file also drives
//! [`crate::db::RepositoryFactory::from_config_file`].
//!
//! ```toml
//! [repository]
//! type = "local"
//!
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [[tokens]]
//! token = "change-me"
//! user_id = 1
//! username = "admin"
//! is_admin = true
//!
//! [facilities.kped]
//! base_url = "http://localhost:8001"
//! secret_key = "..."
//! ```
//!
//! Environment overrides: `HOST`, `PORT`, `KPED_SECRET_KEY`,
//! `JSON_QUEUE_TOKEN`. `SKYPORTAL_CONFIG` names the file to load.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::api::{Principal, UserId};
use crate::db::RepositoryConfig;

/// File read when `SKYPORTAL_CONFIG` is not set, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "skyportal.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub tokens: Vec<TokenSettings>,
    #[serde(default)]
    pub skymaps: SkymapSettings,
    #[serde(default)]
    pub facilities: FacilitiesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request body limit in megabytes.
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_mb: default_body_limit_mb(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit_mb() -> usize {
    50
}

/// API token and the user it authenticates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSettings {
    pub token: String,
    pub user_id: i64,
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl TokenSettings {
    pub fn principal(&self) -> Principal {
        Principal {
            id: UserId(self.user_id),
            username: self.username.clone(),
            is_admin: self.is_admin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkymapSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Accept `file://` skymap URLs.
    #[serde(default)]
    pub allow_local_files: bool,
}

impl Default for SkymapSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_bytes: default_max_bytes(),
            allow_local_files: false,
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_bytes() -> usize {
    256 * 1024 * 1024
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacilitiesConfig {
    #[serde(default)]
    pub kped: Option<KpedSettings>,
    #[serde(default)]
    pub json_queue: Option<JsonQueueSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpedSettings {
    #[serde(default = "default_kped_url")]
    pub base_url: String,
    /// HS256 key shared with the scheduler.
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_facility_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tunnel: Option<TunnelSettings>,
}

fn default_kped_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_facility_timeout_secs() -> u64 {
    30
}

/// SSH port forward opened around each scheduler call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSettings {
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
    /// How long to wait for the forwarded port to accept connections.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonQueueSettings {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_facility_timeout_secs")]
    pub timeout_secs: u64,
}

impl AppConfig {
    /// Parse a configuration from TOML text, without env overrides.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load from `SKYPORTAL_CONFIG`, or [`DEFAULT_CONFIG_FILE`] if present,
    /// or defaults; then apply env overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SKYPORTAL_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            Err(_) => {
                log::warn!("No configuration file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT {port:?} is not a port number")))?;
        }
        if let (Ok(key), Some(kped)) = (std::env::var("KPED_SECRET_KEY"), self.facilities.kped.as_mut()) {
            kped.secret_key = key;
        }
        if let (Ok(token), Some(queue)) = (std::env::var("JSON_QUEUE_TOKEN"), self.facilities.json_queue.as_mut()) {
            queue.token = Some(token);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for token in &self.tokens {
            if token.token.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("empty token for user {}", token.username)));
            }
            if !seen.insert(token.token.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate token for user {}", token.username)));
            }
        }
        if let Some(kped) = &self.facilities.kped {
            if kped.secret_key.is_empty() {
                return Err(ConfigError::Invalid(
                    "facilities.kped.secret_key is required (or set KPED_SECRET_KEY)".into(),
                ));
            }
        }
        if self.tokens.is_empty() {
            log::warn!("No API tokens configured; every authenticated request will be refused");
        }
        Ok(())
    }
}
