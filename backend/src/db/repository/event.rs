//! Repository trait for GCN events and what hangs off them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::RepositoryResult;
use crate::api::{EventFilter, GcnEvent, GcnEventDetail, GcnNotice, GcnProperty, NewGcnNotice, UserId};

/// Storage for events, notices, tags and properties.
///
/// Events are keyed by `dateobs`. Deleting an event removes its notices,
/// tags, properties, localizations and tiles.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Check that the backing store is reachable.
    async fn health_check(&self) -> RepositoryResult<bool>;

    /// Fetch the event at `dateobs`, creating it if absent.
    ///
    /// Atomic: concurrent callers observe exactly one creation.
    /// Returns the event and whether this call created it.
    async fn get_or_create_event(
        &self,
        dateobs: DateTime<Utc>,
        sent_by_id: UserId,
    ) -> RepositoryResult<(GcnEvent, bool)>;

    async fn get_event(&self, dateobs: DateTime<Utc>) -> RepositoryResult<Option<GcnEvent>>;

    /// Event with tags, notices, localization summaries and properties.
    async fn get_event_detail(&self, dateobs: DateTime<Utc>) -> RepositoryResult<Option<GcnEventDetail>>;

    /// Events passing `filter`, most recent first.
    async fn list_events(&self, filter: &EventFilter) -> RepositoryResult<Vec<GcnEventDetail>>;

    /// Delete an event and everything attached to it.
    ///
    /// Returns `false` if there was no such event.
    async fn delete_event(&self, dateobs: DateTime<Utc>) -> RepositoryResult<bool>;

    /// Attach tags; tags already present are skipped.
    async fn add_tags(
        &self,
        dateobs: DateTime<Utc>,
        tags: &[String],
        sent_by_id: UserId,
    ) -> RepositoryResult<()>;

    /// Store a notice unless one with the same checksum exists for the event.
    ///
    /// Returns the stored notice and whether it was inserted.
    async fn add_notice(&self, notice: NewGcnNotice) -> RepositoryResult<(GcnNotice, bool)>;

    async fn add_properties(
        &self,
        dateobs: DateTime<Utc>,
        data: BTreeMap<String, f64>,
        sent_by_id: UserId,
    ) -> RepositoryResult<GcnProperty>;
}
