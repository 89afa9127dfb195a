//! Repository selection at startup.
//!
//! The backend comes from `REPOSITORY_TYPE` when that variable is set and
//! from the `[repository]` section of the configuration file otherwise.
//! Either way the caller gets one `Arc<dyn FullRepository>` to hand to the
//! services.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use super::repo_config::RepositoryConfig;
use super::repositories::LocalRepository;
#[cfg(feature = "postgres-repo")]
use super::repositories::PostgresRepository;
use super::repository::{FullRepository, RepositoryError, RepositoryResult};
use super::PostgresConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryType {
    /// Diesel over an r2d2 Postgres pool.
    Postgres,
    /// Process memory; lost on restart.
    Local,
}

impl FromStr for RepositoryType {
    type Err = String;

    /// Accepts `postgres`, `pg` or `local`, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "local" => Ok(Self::Local),
            _ => Err(format!("Unknown repository type: {s}")),
        }
    }
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Postgres => "postgres",
            Self::Local => "local",
        })
    }
}

impl RepositoryType {
    /// Reads `REPOSITORY_TYPE`; without it, Postgres when a database URL is
    /// set and Local otherwise. An unreadable value falls back to Local.
    pub fn from_env() -> Self {
        if let Ok(value) = std::env::var("REPOSITORY_TYPE") {
            return value.parse().unwrap_or_else(|err| {
                log::warn!("{err}; using the in-memory repository");
                Self::Local
            });
        }

        if std::env::var("DATABASE_URL").is_ok() || std::env::var("PG_DATABASE_URL").is_ok() {
            Self::Postgres
        } else {
            Self::Local
        }
    }
}

#[cfg(feature = "postgres-repo")]
fn postgres_from_env() -> RepositoryResult<PostgresConfig> {
    PostgresConfig::from_env().map_err(RepositoryError::configuration)
}

#[cfg(not(feature = "postgres-repo"))]
fn postgres_from_env() -> RepositoryResult<PostgresConfig> {
    Err(postgres_disabled())
}

#[cfg(not(feature = "postgres-repo"))]
fn postgres_disabled() -> RepositoryError {
    RepositoryError::configuration("Postgres repository feature not enabled")
}

/// Builds repositories behind `Arc<dyn FullRepository>`.
///
/// ```ignore
/// let (repo, kind) = RepositoryFactory::select(&config.repository).await?;
/// log::info!("using the {kind} repository");
/// ```
pub struct RepositoryFactory;

impl RepositoryFactory {
    /// Builds a repository of the given type. Postgres needs its config.
    pub async fn create(
        repo_type: RepositoryType,
        postgres_config: Option<&PostgresConfig>,
    ) -> RepositoryResult<Arc<dyn FullRepository>> {
        match (repo_type, postgres_config) {
            (RepositoryType::Local, _) => Ok(Self::create_local()),
            (RepositoryType::Postgres, None) => Err(RepositoryError::configuration(
                "postgres repository needs a database configuration",
            )),
            #[cfg(feature = "postgres-repo")]
            (RepositoryType::Postgres, Some(config)) => {
                Ok(Self::create_postgres(config).await? as Arc<dyn FullRepository>)
            }
            #[cfg(not(feature = "postgres-repo"))]
            (RepositoryType::Postgres, Some(_)) => Err(postgres_disabled()),
        }
    }

    #[cfg(feature = "postgres-repo")]
    pub async fn create_postgres(config: &PostgresConfig) -> RepositoryResult<Arc<PostgresRepository>> {
        let config = config.clone();
        // Pool construction and migrations block.
        let repo = tokio::task::spawn_blocking(move || PostgresRepository::new(config))
            .await
            .map_err(|e| RepositoryError::internal(format!("repository setup task failed: {e}")))??;
        Ok(Arc::new(repo))
    }

    pub fn create_local() -> Arc<dyn FullRepository> {
        Arc::new(LocalRepository::new())
    }

    /// Uses `REPOSITORY_TYPE` and the `DATABASE_URL`/`PG_*` variables.
    pub async fn from_env() -> RepositoryResult<Arc<dyn FullRepository>> {
        let repo_type = RepositoryType::from_env();
        let postgres = match repo_type {
            RepositoryType::Postgres => Some(postgres_from_env()?),
            RepositoryType::Local => None,
        };
        Self::create(repo_type, postgres.as_ref()).await
    }

    /// Reads the `[repository]`/`[postgres]` sections of a TOML file.
    pub async fn from_config_file<P: AsRef<Path>>(
        config_path: P,
    ) -> RepositoryResult<Arc<dyn FullRepository>> {
        let config = RepositoryConfig::from_file(config_path)?;
        Self::from_repository_config(&config).await
    }

    pub async fn from_repository_config(
        config: &RepositoryConfig,
    ) -> RepositoryResult<Arc<dyn FullRepository>> {
        let repo_type = config.repository_type().map_err(RepositoryError::configuration)?;
        let postgres = config.to_postgres_config()?;
        Self::create(repo_type, postgres.as_ref()).await
    }

    /// Server startup: `REPOSITORY_TYPE` in the environment wins over the
    /// configuration file.
    pub async fn select(
        config: &RepositoryConfig,
    ) -> RepositoryResult<(Arc<dyn FullRepository>, RepositoryType)> {
        if std::env::var("REPOSITORY_TYPE").is_ok() {
            return Ok((Self::from_env().await?, RepositoryType::from_env()));
        }
        let repo_type = config.repository_type().map_err(RepositoryError::configuration)?;
        Ok((Self::from_repository_config(config).await?, repo_type))
    }
}
