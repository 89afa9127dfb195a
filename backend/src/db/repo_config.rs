//! `[repository]` and `[postgres]` sections of `skyportal.toml`.
//!
//! They are read as part of the server configuration but can also be
//! loaded on their own; other sections in the file are ignored.
//!
//! ```toml
//! [repository]
//! type = "postgres"
//!
//! [postgres]
//! database_url = "postgres://skyportal@localhost/skyportal"
//! max_connections = 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::factory::RepositoryType;
use super::repository::RepositoryError;
use crate::db::PostgresConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub repository: RepositorySettings,
    pub postgres: PostgresSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// `local` or `postgres`
    #[serde(rename = "type")]
    pub repo_type: String,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            repo_type: RepositoryType::Local.to_string(),
        }
    }
}

/// Pool sizing and retry policy; timeouts are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    /// Empty means `DATABASE_URL`, then `PG_DATABASE_URL`.
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: u64,
    pub idle_timeout: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: 30,
            idle_timeout: 600,
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

#[cfg(feature = "postgres-repo")]
impl PostgresSettings {
    fn resolved_database_url(&self) -> Option<String> {
        if !self.database_url.is_empty() {
            return Some(self.database_url.clone());
        }
        ["DATABASE_URL", "PG_DATABASE_URL"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .find(|url| !url.is_empty())
    }
}

impl RepositoryConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RepositoryError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            RepositoryError::configuration(format!("cannot parse {}: {e}", path.display()))
        })
    }

    pub fn repository_type(&self) -> Result<RepositoryType, String> {
        self.repository.repo_type.parse()
    }

    /// The Postgres pool settings, or `None` for the in-memory backend.
    ///
    /// Fails when Postgres is selected but no database URL can be found, or
    /// when the crate was built without `postgres-repo`.
    pub fn to_postgres_config(&self) -> Result<Option<PostgresConfig>, RepositoryError> {
        let repo_type = self.repository_type().map_err(RepositoryError::configuration)?;
        if repo_type != RepositoryType::Postgres {
            return Ok(None);
        }
        self.build_postgres_config().map(Some)
    }

    #[cfg(feature = "postgres-repo")]
    fn build_postgres_config(&self) -> Result<PostgresConfig, RepositoryError> {
        let settings = &self.postgres;
        let database_url = settings.resolved_database_url().ok_or_else(|| {
            RepositoryError::configuration("postgres repository requires `postgres.database_url`")
        })?;

        Ok(PostgresConfig {
            database_url,
            max_pool_size: settings.max_connections,
            min_pool_size: settings.min_connections,
            connection_timeout_sec: settings.connect_timeout,
            idle_timeout_sec: settings.idle_timeout,
            max_retries: settings.max_retries,
            retry_delay_ms: settings.retry_delay_ms,
        })
    }

    #[cfg(not(feature = "postgres-repo"))]
    fn build_postgres_config(&self) -> Result<PostgresConfig, RepositoryError> {
        Err(RepositoryError::configuration("Postgres repository feature not enabled"))
    }
}
