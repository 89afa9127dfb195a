//! Repository implementations:
//! - `local`: in-memory store for tests and development
//! - `postgres`: Diesel/Postgres store
pub mod local;
#[cfg(feature = "postgres-repo")]
pub mod postgres;

pub use local::LocalRepository;
#[cfg(feature = "postgres-repo")]
pub use postgres::{PoolStats, PostgresConfig, PostgresRepository};
