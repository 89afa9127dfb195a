//! Postgres repository implementation using Diesel.
//!
//! Events, notices, localizations and follow-up requests live in the tables
//! created by the embedded migrations. Localization tiles are one row per
//! inclusive depth-29 range, keyed by `(localization_id, nested_lo)`, with a
//! secondary index on `nested_hi` so overlap lookups stay index scans.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `DATABASE_URL` or `PG_DATABASE_URL`: Connection string (required)
//! - `PG_POOL_MAX`: Maximum pool size (default: 10)
//! - `PG_POOL_MIN`: Minimum pool size (default: 1)
//! - `PG_CONN_TIMEOUT_SEC`: Connection timeout in seconds (default: 30)
//! - `PG_IDLE_TIMEOUT_SEC`: Idle connection timeout in seconds (default: 600)
//! - `PG_MAX_RETRIES`: Maximum retry attempts for transient failures (default: 3)
//! - `PG_RETRY_DELAY_MS`: Initial retry delay in milliseconds (default: 100)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_query;
use diesel::sql_types::{Array, Int8};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;

use crate::api::{
    EventFilter, FacilityTransaction, FollowupRequest, FollowupRequestId, GcnEvent,
    GcnEventDetail, GcnNotice, GcnProperty, Localization, LocalizationId, LocalizationSummary,
    LocalizationTile, NewFacilityTransaction, NewFollowupRequest, NewGcnNotice, NewLocalization,
    UserId,
};
use crate::db::repository::{
    sort_disjoint_tiles, ErrorContext, EventRepository, FollowupRepository,
    LocalizationRepository, RepositoryError, RepositoryResult,
};
use crate::models::followup::status;

mod models;
mod schema;

use models::*;
use schema::*;

type PgPool = Pool<ConnectionManager<PgConnection>>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("src/db/repositories/postgres/migrations");

/// Rows per tile insert statement; five bind parameters each stays under
/// the 65535 parameter limit.
const TILE_CHUNK_SIZE: usize = 10_000;

/// Configuration for connecting to Postgres.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub connection_timeout_sec: u64,
    pub idle_timeout_sec: u64,
    /// Maximum number of retry attempts for transient failures
    pub max_retries: u32,
    /// Initial retry delay in milliseconds (doubles with each retry)
    pub retry_delay_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_pool_size: 10,
            min_pool_size: 1,
            connection_timeout_sec: 30,
            idle_timeout_sec: 600,
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl PostgresConfig {
    /// Create configuration from the `DATABASE_URL`/`PG_*` environment
    /// variables listed in the module docs.
    pub fn from_env() -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("PG_DATABASE_URL"))
            .map_err(|_| "DATABASE_URL or PG_DATABASE_URL must be set".to_string())?;

        let defaults = Self::default();
        Ok(Self {
            database_url,
            max_pool_size: env_or("PG_POOL_MAX", defaults.max_pool_size),
            min_pool_size: env_or("PG_POOL_MIN", defaults.min_pool_size),
            connection_timeout_sec: env_or("PG_CONN_TIMEOUT_SEC", defaults.connection_timeout_sec),
            idle_timeout_sec: env_or("PG_IDLE_TIMEOUT_SEC", defaults.idle_timeout_sec),
            max_retries: env_or("PG_MAX_RETRIES", defaults.max_retries),
            retry_delay_ms: env_or("PG_RETRY_DELAY_MS", defaults.retry_delay_ms),
        })
    }

    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

/// Pool health statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub connections_in_use: u32,
    pub idle_connections: u32,
    pub total_connections: u32,
    pub max_size: u32,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub retried_operations: u64,
}

/// Diesel-backed repository for Postgres.
#[derive(Clone, Debug)]
pub struct PostgresRepository {
    pool: PgPool,
    config: PostgresConfig,
    total_queries: Arc<AtomicU64>,
    failed_queries: Arc<AtomicU64>,
    retried_operations: Arc<AtomicU64>,
}

impl PostgresRepository {
    /// Build the connection pool and run pending migrations.
    pub fn new(config: PostgresConfig) -> RepositoryResult<Self> {
        let manager = ConnectionManager::<PgConnection>::new(&config.database_url);

        let pool = Pool::builder()
            .max_size(config.max_pool_size)
            .min_idle(Some(config.min_pool_size))
            .connection_timeout(Duration::from_secs(config.connection_timeout_sec))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_sec)))
            .test_on_check_out(true)
            .build(manager)
            .map_err(|e| {
                RepositoryError::connection_with_context(
                    e.to_string(),
                    ErrorContext::new("create_pool")
                        .with_details(format!("max_size={}", config.max_pool_size)),
                )
            })?;

        {
            let mut conn = pool.get().map_err(|e| {
                RepositoryError::connection_with_context(
                    e.to_string(),
                    ErrorContext::new("get_connection_for_migrations"),
                )
            })?;
            Self::run_migrations(&mut conn)?;
        }

        log::info!(
            "Postgres repository ready (pool max={}, min={})",
            config.max_pool_size,
            config.min_pool_size
        );

        Ok(Self {
            pool,
            config,
            total_queries: Arc::new(AtomicU64::new(0)),
            failed_queries: Arc::new(AtomicU64::new(0)),
            retried_operations: Arc::new(AtomicU64::new(0)),
        })
    }

    fn run_migrations(conn: &mut PgConnection) -> RepositoryResult<()> {
        conn.run_pending_migrations(MIGRATIONS).map_err(|e| {
            RepositoryError::internal_with_context(
                format!("Migration failed: {}", e),
                ErrorContext::new("run_migrations"),
            )
        })?;
        Ok(())
    }

    /// Run `f` on a pooled connection inside `spawn_blocking`, retrying
    /// retryable failures with exponential backoff.
    async fn with_conn<T, F>(&self, f: F) -> RepositoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> RepositoryResult<T> + Send + 'static + Clone,
    {
        let pool = self.pool.clone();
        let max_retries = self.config.max_retries;
        let retry_delay_ms = self.config.retry_delay_ms;
        let total_queries = self.total_queries.clone();
        let failed_queries = self.failed_queries.clone();
        let retried_operations = self.retried_operations.clone();

        task::spawn_blocking(move || {
            let mut last_error = None;
            let mut retry_delay = Duration::from_millis(retry_delay_ms);

            for attempt in 0..=max_retries {
                if attempt > 0 {
                    retried_operations.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(retry_delay);
                    retry_delay *= 2;
                }

                let mut conn = match pool.get() {
                    Ok(c) => c,
                    Err(e) => {
                        let err = RepositoryError::connection_with_context(
                            e.to_string(),
                            ErrorContext::new("get_connection")
                                .with_details(format!("attempt={}", attempt + 1)),
                        );
                        if attempt < max_retries {
                            log::warn!("Postgres connection attempt {} failed: {}", attempt + 1, err);
                            last_error = Some(err);
                            continue;
                        }
                        failed_queries.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                };

                total_queries.fetch_add(1, Ordering::Relaxed);
                match f.clone()(&mut conn) {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_retryable() && attempt < max_retries => {
                        last_error = Some(e);
                        continue;
                    }
                    Err(e) => {
                        failed_queries.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                }
            }

            failed_queries.fetch_add(1, Ordering::Relaxed);
            Err(last_error.unwrap_or_else(|| {
                RepositoryError::internal("Max retries exceeded with no error captured")
            }))
        })
        .await
        .map_err(|e| {
            RepositoryError::internal_with_context(
                format!("Task join error: {}", e),
                ErrorContext::new("spawn_blocking"),
            )
        })?
    }

    pub fn get_pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections_in_use: state.connections - state.idle_connections,
            idle_connections: state.idle_connections,
            total_connections: state.connections,
            max_size: self.config.max_pool_size,
            total_queries: self.total_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            retried_operations: self.retried_operations.load(Ordering::Relaxed),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.health_check().await.unwrap_or(false)
    }

    /// Returns `(is_healthy, latency_ms, error_message)`.
    pub async fn health_check_detailed(&self) -> (bool, Option<u64>, Option<String>) {
        let start = Instant::now();
        let result = self.health_check().await;
        let latency = Some(start.elapsed().as_millis() as u64);
        match result {
            Ok(true) => (true, latency, None),
            Ok(false) => (false, latency, Some("Health check returned false".to_string())),
            Err(e) => (false, latency, Some(e.to_string())),
        }
    }
}

fn map_diesel_error(err: diesel::result::Error) -> RepositoryError {
    RepositoryError::from(err)
}

fn event_exists(conn: &mut PgConnection, dateobs: DateTime<Utc>) -> RepositoryResult<bool> {
    diesel::select(diesel::dsl::exists(
        gcnevents::table.filter(gcnevents::dateobs.eq(dateobs)),
    ))
    .get_result(conn)
    .map_err(map_diesel_error)
}

fn require_event(conn: &mut PgConnection, dateobs: DateTime<Utc>, operation: &str) -> RepositoryResult<()> {
    if event_exists(conn, dateobs)? {
        Ok(())
    } else {
        Err(RepositoryError::not_found_with_context(
            format!("GCN event {dateobs} not found"),
            ErrorContext::new(operation).with_entity("gcn_event"),
        ))
    }
}

fn properties_from_json(value: Value) -> RepositoryResult<BTreeMap<String, f64>> {
    serde_json::from_value(value)
        .map_err(|e| RepositoryError::internal(format!("Failed to parse properties JSON: {e}")))
}

fn load_detail(conn: &mut PgConnection, event: GcnEventRow) -> RepositoryResult<GcnEventDetail> {
    let dateobs = event.dateobs;

    let tags = gcntags::table
        .filter(gcntags::dateobs.eq(dateobs))
        .order(gcntags::id.asc())
        .select(gcntags::text)
        .load::<String>(conn)
        .map_err(map_diesel_error)?;

    let notices = gcnnotices::table
        .filter(gcnnotices::dateobs.eq(dateobs))
        .order(gcnnotices::id.asc())
        .select(GcnNoticeRow::as_select())
        .load::<GcnNoticeRow>(conn)
        .map_err(map_diesel_error)?
        .into_iter()
        .map(GcnNotice::from)
        .collect();

    let localizations = localizations::table
        .filter(localizations::dateobs.eq(dateobs))
        .order(localizations::id.asc())
        .select((
            localizations::id,
            localizations::localization_name,
            localizations::sent_by_id,
            localizations::created_at,
        ))
        .load::<(i64, String, i64, DateTime<Utc>)>(conn)
        .map_err(map_diesel_error)?
        .into_iter()
        .map(|(id, localization_name, sent_by_id, created_at)| LocalizationSummary {
            id: LocalizationId(id),
            dateobs,
            localization_name,
            sent_by_id: UserId(sent_by_id),
            created_at,
        })
        .collect();

    let properties = gcnproperties::table
        .filter(gcnproperties::dateobs.eq(dateobs))
        .order((gcnproperties::created_at.asc(), gcnproperties::id.asc()))
        .select(GcnPropertyRow::as_select())
        .load::<GcnPropertyRow>(conn)
        .map_err(map_diesel_error)?
        .into_iter()
        .map(|row| {
            Ok(GcnProperty {
                dateobs: row.dateobs,
                data: properties_from_json(row.data)?,
                sent_by_id: UserId(row.sent_by_id),
                created_at: row.created_at,
            })
        })
        .collect::<RepositoryResult<Vec<_>>>()?;

    Ok(GcnEventDetail {
        event: event.into(),
        tags,
        notices,
        localizations,
        properties,
    })
}

#[async_trait]
impl EventRepository for PostgresRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        self.with_conn(|conn| {
            sql_query("SELECT 1")
                .execute(conn)
                .map(|_| true)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn get_or_create_event(
        &self,
        dateobs: DateTime<Utc>,
        sent_by_id: UserId,
    ) -> RepositoryResult<(GcnEvent, bool)> {
        self.with_conn(move |conn| {
            let inserted = diesel::insert_into(gcnevents::table)
                .values(&NewGcnEventRow {
                    dateobs,
                    sent_by_id: sent_by_id.0,
                })
                .on_conflict_do_nothing()
                .execute(conn)
                .map_err(map_diesel_error)?;

            let event = gcnevents::table
                .filter(gcnevents::dateobs.eq(dateobs))
                .select(GcnEventRow::as_select())
                .first::<GcnEventRow>(conn)
                .map_err(map_diesel_error)?;

            Ok((event.into(), inserted == 1))
        })
        .await
    }

    async fn get_event(&self, dateobs: DateTime<Utc>) -> RepositoryResult<Option<GcnEvent>> {
        self.with_conn(move |conn| {
            gcnevents::table
                .filter(gcnevents::dateobs.eq(dateobs))
                .select(GcnEventRow::as_select())
                .first::<GcnEventRow>(conn)
                .optional()
                .map(|row| row.map(GcnEvent::from))
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn get_event_detail(&self, dateobs: DateTime<Utc>) -> RepositoryResult<Option<GcnEventDetail>> {
        self.with_conn(move |conn| {
            let event = gcnevents::table
                .filter(gcnevents::dateobs.eq(dateobs))
                .select(GcnEventRow::as_select())
                .first::<GcnEventRow>(conn)
                .optional()
                .map_err(map_diesel_error)?;
            event.map(|row| load_detail(conn, row)).transpose()
        })
        .await
    }

    async fn list_events(&self, filter: &EventFilter) -> RepositoryResult<Vec<GcnEventDetail>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut query = gcnevents::table
                .select(GcnEventRow::as_select())
                .order(gcnevents::dateobs.desc())
                .into_boxed();
            if let Some(start) = filter.start_date {
                query = query.filter(gcnevents::dateobs.ge(start));
            }
            if let Some(end) = filter.end_date {
                query = query.filter(gcnevents::dateobs.le(end));
            }
            let rows = query.load::<GcnEventRow>(conn).map_err(map_diesel_error)?;

            let mut events = Vec::with_capacity(rows.len());
            for row in rows {
                let detail = load_detail(conn, row)?;
                if filter.matches(&detail) {
                    events.push(detail);
                }
            }
            Ok(events)
        })
        .await
    }

    async fn delete_event(&self, dateobs: DateTime<Utc>) -> RepositoryResult<bool> {
        self.with_conn(move |conn| {
            diesel::delete(gcnevents::table.filter(gcnevents::dateobs.eq(dateobs)))
                .execute(conn)
                .map(|n| n > 0)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn add_tags(
        &self,
        dateobs: DateTime<Utc>,
        tags: &[String],
        sent_by_id: UserId,
    ) -> RepositoryResult<()> {
        let rows: Vec<NewGcnTagRow> = tags
            .iter()
            .map(|text| NewGcnTagRow {
                dateobs,
                text: text.clone(),
                sent_by_id: sent_by_id.0,
            })
            .collect();
        self.with_conn(move |conn| {
            conn.transaction(|tx| {
                require_event(tx, dateobs, "add_tags")?;
                if !rows.is_empty() {
                    diesel::insert_into(gcntags::table)
                        .values(&rows)
                        .on_conflict((gcntags::dateobs, gcntags::text))
                        .do_nothing()
                        .execute(tx)
                        .map_err(map_diesel_error)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn add_notice(&self, notice: NewGcnNotice) -> RepositoryResult<(GcnNotice, bool)> {
        let row = NewGcnNoticeRow {
            dateobs: notice.dateobs,
            ivorn: notice.ivorn,
            notice_type: notice.notice_type,
            stream: notice.stream,
            date: notice.date,
            content: notice.content,
            checksum: notice.checksum,
            sent_by_id: notice.sent_by_id.0,
        };
        self.with_conn(move |conn| {
            conn.transaction(|tx| {
                require_event(tx, row.dateobs, "add_notice")?;
                let inserted = diesel::insert_into(gcnnotices::table)
                    .values(&row)
                    .on_conflict((gcnnotices::dateobs, gcnnotices::checksum))
                    .do_nothing()
                    .execute(tx)
                    .map_err(map_diesel_error)?;
                let stored = gcnnotices::table
                    .filter(gcnnotices::dateobs.eq(row.dateobs))
                    .filter(gcnnotices::checksum.eq(&row.checksum))
                    .select(GcnNoticeRow::as_select())
                    .first::<GcnNoticeRow>(tx)
                    .map_err(map_diesel_error)?;
                Ok((stored.into(), inserted == 1))
            })
        })
        .await
    }

    async fn add_properties(
        &self,
        dateobs: DateTime<Utc>,
        data: BTreeMap<String, f64>,
        sent_by_id: UserId,
    ) -> RepositoryResult<GcnProperty> {
        let json = serde_json::to_value(&data)
            .map_err(|e| RepositoryError::internal(format!("Failed to encode properties: {e}")))?;
        self.with_conn(move |conn| {
            conn.transaction(|tx| {
                require_event(tx, dateobs, "add_properties")?;
                let row = diesel::insert_into(gcnproperties::table)
                    .values(&NewGcnPropertyRow {
                        dateobs,
                        data: json.clone(),
                        sent_by_id: sent_by_id.0,
                    })
                    .returning(GcnPropertyRow::as_returning())
                    .get_result::<GcnPropertyRow>(tx)
                    .map_err(map_diesel_error)?;
                Ok(GcnProperty {
                    dateobs: row.dateobs,
                    data: properties_from_json(row.data)?,
                    sent_by_id: UserId(row.sent_by_id),
                    created_at: row.created_at,
                })
            })
        })
        .await
    }
}

#[async_trait]
impl LocalizationRepository for PostgresRepository {
    async fn get_or_create_localization(
        &self,
        new: NewLocalization,
    ) -> RepositoryResult<(Localization, bool)> {
        let row = NewLocalizationRow {
            dateobs: new.dateobs,
            localization_name: new.localization_name,
            uniq: new.uniq,
            probdensity: new.probdensity,
            sent_by_id: new.sent_by_id.0,
        };
        self.with_conn(move |conn| {
            conn.transaction(|tx| {
                require_event(tx, row.dateobs, "get_or_create_localization")?;
                let inserted = diesel::insert_into(localizations::table)
                    .values(&row)
                    .on_conflict((localizations::dateobs, localizations::localization_name))
                    .do_nothing()
                    .execute(tx)
                    .map_err(map_diesel_error)?;
                let stored = localizations::table
                    .filter(localizations::dateobs.eq(row.dateobs))
                    .filter(localizations::localization_name.eq(&row.localization_name))
                    .select(LocalizationRow::as_select())
                    .first::<LocalizationRow>(tx)
                    .map_err(map_diesel_error)?;
                Ok((stored.into(), inserted == 1))
            })
        })
        .await
    }

    async fn get_localization(&self, id: LocalizationId) -> RepositoryResult<Option<Localization>> {
        self.with_conn(move |conn| {
            localizations::table
                .find(id.0)
                .select(LocalizationRow::as_select())
                .first::<LocalizationRow>(conn)
                .optional()
                .map(|row| row.map(Localization::from))
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn find_localization(
        &self,
        dateobs: DateTime<Utc>,
        localization_name: &str,
    ) -> RepositoryResult<Option<Localization>> {
        let name = localization_name.to_string();
        self.with_conn(move |conn| {
            localizations::table
                .filter(localizations::dateobs.eq(dateobs))
                .filter(localizations::localization_name.eq(&name))
                .select(LocalizationRow::as_select())
                .first::<LocalizationRow>(conn)
                .optional()
                .map(|row| row.map(Localization::from))
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn delete_localization(&self, id: LocalizationId) -> RepositoryResult<bool> {
        self.with_conn(move |conn| {
            diesel::delete(localizations::table.find(id.0))
                .execute(conn)
                .map(|n| n > 0)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn set_localization_derived(
        &self,
        id: LocalizationId,
        flat_2d: Vec<f64>,
        contour: Value,
    ) -> RepositoryResult<()> {
        self.with_conn(move |conn| {
            let updated = diesel::update(localizations::table.find(id.0))
                .set((
                    localizations::flat_2d.eq(Some(&flat_2d)),
                    localizations::contour.eq(Some(&contour)),
                ))
                .execute(conn)
                .map_err(map_diesel_error)?;
            if updated == 0 {
                return Err(RepositoryError::not_found_with_context(
                    "localization not found",
                    ErrorContext::new("set_localization_derived").with_entity_id(id),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn replace_tiles(
        &self,
        id: LocalizationId,
        mut tiles: Vec<LocalizationTile>,
    ) -> RepositoryResult<usize> {
        sort_disjoint_tiles(id, &mut tiles)?;
        let rows: Vec<LocalizationTileRow> = tiles.iter().map(LocalizationTileRow::from).collect();
        self.with_conn(move |conn| {
            conn.transaction(|tx| {
                let exists: bool = diesel::select(diesel::dsl::exists(localizations::table.find(id.0)))
                    .get_result(tx)
                    .map_err(map_diesel_error)?;
                if !exists {
                    return Err(RepositoryError::not_found_with_context(
                        "localization not found",
                        ErrorContext::new("replace_tiles").with_entity_id(id),
                    ));
                }

                diesel::delete(
                    localizationtiles::table.filter(localizationtiles::localization_id.eq(id.0)),
                )
                .execute(tx)
                .map_err(map_diesel_error)?;

                for chunk in rows.chunks(TILE_CHUNK_SIZE) {
                    diesel::insert_into(localizationtiles::table)
                        .values(chunk)
                        .execute(tx)
                        .map_err(map_diesel_error)?;
                }
                Ok(rows.len())
            })
        })
        .await
    }

    async fn count_tiles(&self, id: LocalizationId) -> RepositoryResult<usize> {
        self.with_conn(move |conn| {
            localizationtiles::table
                .filter(localizationtiles::localization_id.eq(id.0))
                .count()
                .get_result::<i64>(conn)
                .map(|n| n as usize)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn tile_containing(
        &self,
        id: LocalizationId,
        index: i64,
    ) -> RepositoryResult<Option<LocalizationTile>> {
        self.with_conn(move |conn| {
            localizationtiles::table
                .filter(localizationtiles::localization_id.eq(id.0))
                .filter(localizationtiles::nested_lo.le(index))
                .filter(localizationtiles::nested_hi.ge(index))
                .select(LocalizationTileRow::as_select())
                .first::<LocalizationTileRow>(conn)
                .optional()
                .map(|row| row.map(LocalizationTile::from))
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn tiles_overlapping(
        &self,
        id: LocalizationId,
        ranges: &[(i64, i64)],
    ) -> RepositoryResult<Vec<LocalizationTile>> {
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        let (los, his): (Vec<i64>, Vec<i64>) = ranges.iter().copied().unzip();
        self.with_conn(move |conn| {
            sql_query(
                "SELECT DISTINCT t.localization_id, t.nested_lo, t.nested_hi, t.probdensity, t.cumprob \
                 FROM localizationtiles t \
                 JOIN unnest($2, $3) AS q(lo, hi) ON t.nested_lo <= q.hi AND q.lo <= t.nested_hi \
                 WHERE t.localization_id = $1 \
                 ORDER BY t.nested_lo",
            )
            .bind::<Int8, _>(id.0)
            .bind::<Array<Int8>, _>(&los)
            .bind::<Array<Int8>, _>(&his)
            .load::<LocalizationTileRow>(conn)
            .map(|rows| rows.into_iter().map(LocalizationTile::from).collect())
            .map_err(map_diesel_error)
        })
        .await
    }

    async fn tiles_within_level(
        &self,
        id: LocalizationId,
        level: f64,
    ) -> RepositoryResult<Vec<LocalizationTile>> {
        self.with_conn(move |conn| {
            localizationtiles::table
                .filter(localizationtiles::localization_id.eq(id.0))
                .filter(localizationtiles::cumprob.le(level))
                .order(localizationtiles::nested_lo.asc())
                .select(LocalizationTileRow::as_select())
                .load::<LocalizationTileRow>(conn)
                .map(|rows| rows.into_iter().map(LocalizationTile::from).collect())
                .map_err(map_diesel_error)
        })
        .await
    }
}

#[async_trait]
impl FollowupRepository for PostgresRepository {
    async fn create_followup_request(&self, new: NewFollowupRequest) -> RepositoryResult<FollowupRequest> {
        let row = NewFollowupRequestRow {
            obj_id: new.obj.id,
            obj_ra: new.obj.ra,
            obj_dec: new.obj.dec,
            allocation_id: new.allocation_id,
            facility: new.facility.as_str().to_string(),
            requester_id: new.requester.id.0,
            requester_username: new.requester.username,
            payload: new.payload,
            status: status::PENDING.to_string(),
            last_modified_by_id: new.requester.id.0,
        };
        self.with_conn(move |conn| {
            diesel::insert_into(followuprequests::table)
                .values(&row)
                .returning(FollowupRequestRow::as_returning())
                .get_result::<FollowupRequestRow>(conn)
                .map_err(map_diesel_error)
                .and_then(FollowupRequest::try_from)
        })
        .await
    }

    async fn get_followup_request(&self, id: FollowupRequestId) -> RepositoryResult<Option<FollowupRequest>> {
        self.with_conn(move |conn| {
            followuprequests::table
                .find(id.0)
                .select(FollowupRequestRow::as_select())
                .first::<FollowupRequestRow>(conn)
                .optional()
                .map_err(map_diesel_error)?
                .map(FollowupRequest::try_from)
                .transpose()
        })
        .await
    }

    async fn update_followup_status(
        &self,
        id: FollowupRequestId,
        new_status: &str,
        modified_by: UserId,
    ) -> RepositoryResult<FollowupRequest> {
        let new_status = new_status.to_string();
        self.with_conn(move |conn| {
            diesel::update(followuprequests::table.find(id.0))
                .set((
                    followuprequests::status.eq(&new_status),
                    followuprequests::last_modified_by_id.eq(modified_by.0),
                    followuprequests::modified.eq(Utc::now()),
                ))
                .returning(FollowupRequestRow::as_returning())
                .get_result::<FollowupRequestRow>(conn)
                .optional()
                .map_err(map_diesel_error)?
                .ok_or_else(|| {
                    RepositoryError::not_found_with_context(
                        "follow-up request not found",
                        ErrorContext::new("update_followup_status").with_entity_id(id),
                    )
                })
                .and_then(FollowupRequest::try_from)
        })
        .await
    }

    async fn delete_followup_request(&self, id: FollowupRequestId) -> RepositoryResult<bool> {
        self.with_conn(move |conn| {
            diesel::delete(followuprequests::table.find(id.0))
                .execute(conn)
                .map(|n| n > 0)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn add_transaction(&self, new: NewFacilityTransaction) -> RepositoryResult<FacilityTransaction> {
        let row = NewFacilityTransactionRow {
            followup_request_id: new.followup_request_id.0,
            initiator_id: new.initiator_id.0,
            request: new.request,
            response: new.response,
        };
        self.with_conn(move |conn| {
            conn.transaction(|tx| {
                let exists: bool = diesel::select(diesel::dsl::exists(
                    followuprequests::table.find(row.followup_request_id),
                ))
                .get_result(tx)
                .map_err(map_diesel_error)?;
                if !exists {
                    return Err(RepositoryError::not_found_with_context(
                        "follow-up request not found",
                        ErrorContext::new("add_transaction").with_entity_id(row.followup_request_id),
                    ));
                }
                diesel::insert_into(facilitytransactions::table)
                    .values(&row)
                    .returning(FacilityTransactionRow::as_returning())
                    .get_result::<FacilityTransactionRow>(tx)
                    .map(FacilityTransaction::from)
                    .map_err(map_diesel_error)
            })
        })
        .await
    }

    async fn list_transactions(&self, id: FollowupRequestId) -> RepositoryResult<Vec<FacilityTransaction>> {
        self.with_conn(move |conn| {
            facilitytransactions::table
                .filter(facilitytransactions::followup_request_id.eq(id.0))
                .order(facilitytransactions::id.asc())
                .select(FacilityTransactionRow::as_select())
                .load::<FacilityTransactionRow>(conn)
                .map(|rows| rows.into_iter().map(FacilityTransaction::from).collect())
                .map_err(map_diesel_error)
        })
        .await
    }
}
