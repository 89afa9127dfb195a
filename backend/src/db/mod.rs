//! Storage for GCN events, localizations and follow-up requests.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  services (ingest, tiling, crossmatch, follow-up)        │
//! └───────────────────┬──────────────────────────────────────┘
//!                     │ Arc<dyn FullRepository>
//! ┌───────────────────▼──────────────────────────────────────┐
//! │  repository traits: Event / Localization / Followup      │
//! └───────────────────┬──────────────────────────────────────┘
//!          ┌──────────┴───────────┐
//!   LocalRepository        PostgresRepository
//!     (in-memory)        (Diesel + r2d2, feature
//!                           `postgres-repo`)
//! ```
//!
//! The repository handle is built once at startup by [`RepositoryFactory`]
//! and passed to everything that needs it; there is no process-global
//! instance.

#[cfg(not(any(feature = "postgres-repo", feature = "local-repo")))]
compile_error!("Enable at least one repository backend feature.");

pub mod checksum;
pub mod factory;
pub mod repo_config;
pub mod repositories;
pub mod repository;

#[cfg(feature = "postgres-repo")]
pub use repositories::postgres::{PoolStats, PostgresConfig};
#[cfg(not(feature = "postgres-repo"))]
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    _private: (),
}

pub use checksum::notice_checksum;
pub use factory::{RepositoryFactory, RepositoryType};
pub use repo_config::RepositoryConfig;
pub use repositories::LocalRepository;
#[cfg(feature = "postgres-repo")]
pub use repositories::PostgresRepository;
pub use repository::{
    ErrorContext, EventRepository, FollowupRepository, FullRepository, LocalizationRepository,
    RepositoryError, RepositoryResult,
};
