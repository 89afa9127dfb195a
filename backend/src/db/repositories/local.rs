//! In-memory local repository implementation.
//!
//! Implements every repository trait over plain collections behind one
//! `RwLock`, for unit tests and local development. Each get-or-create runs
//! under the write lock, so concurrent ingests of the same event or
//! localization resolve to a single row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::api::*;
use crate::db::repository::*;

/// In-memory local repository.
///
/// # Example
/// ```
/// use skyportal_rust::db::repositories::LocalRepository;
///
/// let repo = LocalRepository::new();
/// assert_eq!(repo.total_tiles(), 0);
/// ```
#[derive(Clone)]
pub struct LocalRepository {
    data: Arc<RwLock<LocalData>>,
}

struct LocalData {
    events: BTreeMap<DateTime<Utc>, GcnEvent>,
    notices: Vec<GcnNotice>,
    tags: Vec<GcnTag>,
    properties: Vec<GcnProperty>,
    localizations: BTreeMap<LocalizationId, Localization>,
    /// Tiles per localization, sorted by `nested_lo`.
    tiles: HashMap<LocalizationId, Vec<LocalizationTile>>,
    followups: BTreeMap<FollowupRequestId, FollowupRequest>,
    transactions: Vec<FacilityTransaction>,

    next_notice_id: i64,
    next_localization_id: i64,
    next_request_id: i64,
    next_transaction_id: i64,

    is_healthy: bool,
}

impl Default for LocalData {
    fn default() -> Self {
        Self {
            events: BTreeMap::new(),
            notices: Vec::new(),
            tags: Vec::new(),
            properties: Vec::new(),
            localizations: BTreeMap::new(),
            tiles: HashMap::new(),
            followups: BTreeMap::new(),
            transactions: Vec::new(),
            next_notice_id: 1,
            next_localization_id: 1,
            next_request_id: 1,
            next_transaction_id: 1,
            is_healthy: true,
        }
    }
}

impl LocalData {
    fn detail(&self, event: &GcnEvent) -> GcnEventDetail {
        let dateobs = event.dateobs;
        GcnEventDetail {
            event: event.clone(),
            tags: self
                .tags
                .iter()
                .filter(|t| t.dateobs == dateobs)
                .map(|t| t.text.clone())
                .collect(),
            notices: self
                .notices
                .iter()
                .filter(|n| n.dateobs == dateobs)
                .cloned()
                .collect(),
            localizations: self
                .localizations
                .values()
                .filter(|l| l.dateobs == dateobs)
                .map(LocalizationSummary::from)
                .collect(),
            properties: self
                .properties
                .iter()
                .filter(|p| p.dateobs == dateobs)
                .cloned()
                .collect(),
        }
    }

    fn remove_localization(&mut self, id: LocalizationId) -> bool {
        self.tiles.remove(&id);
        self.localizations.remove(&id).is_some()
    }
}

impl LocalRepository {
    /// Create a new empty local repository.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(LocalData::default())),
        }
    }

    fn read(&self) -> RepositoryResult<RwLockReadGuard<'_, LocalData>> {
        self.data.read().map_err(|_| RepositoryError::poisoned())
    }

    fn write(&self) -> RepositoryResult<RwLockWriteGuard<'_, LocalData>> {
        self.data.write().map_err(|_| RepositoryError::poisoned())
    }

    /// Toggle the result of `health_check`, for exercising error paths.
    pub fn set_healthy(&self, healthy: bool) {
        if let Ok(mut data) = self.data.write() {
            data.is_healthy = healthy;
        }
    }

    /// Clear all data from the repository.
    pub fn clear(&self) {
        if let Ok(mut data) = self.data.write() {
            let healthy = data.is_healthy;
            *data = LocalData {
                is_healthy: healthy,
                ..Default::default()
            };
        }
    }

    /// Number of tiles stored across all localizations.
    pub fn total_tiles(&self) -> usize {
        self.data
            .read()
            .map(|d| d.tiles.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

impl Default for LocalRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventRepository for LocalRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        Ok(self.read()?.is_healthy)
    }

    async fn get_or_create_event(
        &self,
        dateobs: DateTime<Utc>,
        sent_by_id: UserId,
    ) -> RepositoryResult<(GcnEvent, bool)> {
        let mut data = self.write()?;
        if let Some(existing) = data.events.get(&dateobs) {
            return Ok((existing.clone(), false));
        }
        let event = GcnEvent {
            dateobs,
            sent_by_id,
            created_at: Utc::now(),
        };
        data.events.insert(dateobs, event.clone());
        Ok((event, true))
    }

    async fn get_event(&self, dateobs: DateTime<Utc>) -> RepositoryResult<Option<GcnEvent>> {
        Ok(self.read()?.events.get(&dateobs).cloned())
    }

    async fn get_event_detail(&self, dateobs: DateTime<Utc>) -> RepositoryResult<Option<GcnEventDetail>> {
        let data = self.read()?;
        Ok(data.events.get(&dateobs).map(|e| data.detail(e)))
    }

    async fn list_events(&self, filter: &EventFilter) -> RepositoryResult<Vec<GcnEventDetail>> {
        let data = self.read()?;
        Ok(data
            .events
            .values()
            .rev()
            .filter(|e| filter.in_date_range(&e.dateobs))
            .map(|e| data.detail(e))
            .filter(|d| filter.matches(d))
            .collect())
    }

    async fn delete_event(&self, dateobs: DateTime<Utc>) -> RepositoryResult<bool> {
        let mut data = self.write()?;
        if data.events.remove(&dateobs).is_none() {
            return Ok(false);
        }
        data.notices.retain(|n| n.dateobs != dateobs);
        data.tags.retain(|t| t.dateobs != dateobs);
        data.properties.retain(|p| p.dateobs != dateobs);
        let localization_ids: Vec<LocalizationId> = data
            .localizations
            .values()
            .filter(|l| l.dateobs == dateobs)
            .map(|l| l.id)
            .collect();
        for id in localization_ids {
            data.remove_localization(id);
        }
        Ok(true)
    }

    async fn add_tags(
        &self,
        dateobs: DateTime<Utc>,
        tags: &[String],
        sent_by_id: UserId,
    ) -> RepositoryResult<()> {
        let mut data = self.write()?;
        if !data.events.contains_key(&dateobs) {
            return Err(RepositoryError::not_found(format!("GCN event {dateobs} not found")));
        }
        for text in tags {
            let exists = data.tags.iter().any(|t| t.dateobs == dateobs && &t.text == text);
            if !exists {
                data.tags.push(GcnTag {
                    dateobs,
                    text: text.clone(),
                    sent_by_id,
                });
            }
        }
        Ok(())
    }

    async fn add_notice(&self, notice: NewGcnNotice) -> RepositoryResult<(GcnNotice, bool)> {
        let mut data = self.write()?;
        if !data.events.contains_key(&notice.dateobs) {
            return Err(RepositoryError::not_found(format!(
                "GCN event {} not found",
                notice.dateobs
            )));
        }
        if let Some(existing) = data
            .notices
            .iter()
            .find(|n| n.dateobs == notice.dateobs && n.checksum == notice.checksum)
        {
            return Ok((existing.clone(), false));
        }
        let stored = GcnNotice {
            id: NoticeId(data.next_notice_id),
            dateobs: notice.dateobs,
            ivorn: notice.ivorn,
            notice_type: notice.notice_type,
            stream: notice.stream,
            date: notice.date,
            content: notice.content,
            checksum: notice.checksum,
            sent_by_id: notice.sent_by_id,
            created_at: Utc::now(),
        };
        data.next_notice_id += 1;
        data.notices.push(stored.clone());
        Ok((stored, true))
    }

    async fn add_properties(
        &self,
        dateobs: DateTime<Utc>,
        properties: BTreeMap<String, f64>,
        sent_by_id: UserId,
    ) -> RepositoryResult<GcnProperty> {
        let mut data = self.write()?;
        if !data.events.contains_key(&dateobs) {
            return Err(RepositoryError::not_found(format!("GCN event {dateobs} not found")));
        }
        let property = GcnProperty {
            dateobs,
            data: properties,
            sent_by_id,
            created_at: Utc::now(),
        };
        data.properties.push(property.clone());
        Ok(property)
    }
}

#[async_trait]
impl LocalizationRepository for LocalRepository {
    async fn get_or_create_localization(
        &self,
        new: NewLocalization,
    ) -> RepositoryResult<(Localization, bool)> {
        let mut data = self.write()?;
        if !data.events.contains_key(&new.dateobs) {
            return Err(RepositoryError::not_found(format!(
                "GCN event {} not found",
                new.dateobs
            )));
        }
        if let Some(existing) = data
            .localizations
            .values()
            .find(|l| l.dateobs == new.dateobs && l.localization_name == new.localization_name)
        {
            return Ok((existing.clone(), false));
        }

        let id = LocalizationId(data.next_localization_id);
        data.next_localization_id += 1;
        let localization = Localization {
            id,
            dateobs: new.dateobs,
            localization_name: new.localization_name,
            uniq: new.uniq,
            probdensity: new.probdensity,
            flat_2d: None,
            contour: None,
            sent_by_id: new.sent_by_id,
            created_at: Utc::now(),
        };
        data.localizations.insert(id, localization.clone());
        Ok((localization, true))
    }

    async fn get_localization(&self, id: LocalizationId) -> RepositoryResult<Option<Localization>> {
        Ok(self.read()?.localizations.get(&id).cloned())
    }

    async fn find_localization(
        &self,
        dateobs: DateTime<Utc>,
        localization_name: &str,
    ) -> RepositoryResult<Option<Localization>> {
        Ok(self
            .read()?
            .localizations
            .values()
            .find(|l| l.dateobs == dateobs && l.localization_name == localization_name)
            .cloned())
    }

    async fn delete_localization(&self, id: LocalizationId) -> RepositoryResult<bool> {
        Ok(self.write()?.remove_localization(id))
    }

    async fn set_localization_derived(
        &self,
        id: LocalizationId,
        flat_2d: Vec<f64>,
        contour: serde_json::Value,
    ) -> RepositoryResult<()> {
        let mut data = self.write()?;
        let localization = data.localizations.get_mut(&id).ok_or_else(|| {
            RepositoryError::not_found_with_context(
                "localization not found",
                ErrorContext::new("set_localization_derived").with_entity_id(id),
            )
        })?;
        localization.flat_2d = Some(flat_2d);
        localization.contour = Some(contour);
        Ok(())
    }

    async fn replace_tiles(
        &self,
        id: LocalizationId,
        mut tiles: Vec<LocalizationTile>,
    ) -> RepositoryResult<usize> {
        let mut data = self.write()?;
        if !data.localizations.contains_key(&id) {
            return Err(RepositoryError::not_found_with_context(
                "localization not found",
                ErrorContext::new("replace_tiles").with_entity_id(id),
            ));
        }
        sort_disjoint_tiles(id, &mut tiles)?;
        let count = tiles.len();
        data.tiles.insert(id, tiles);
        Ok(count)
    }

    async fn count_tiles(&self, id: LocalizationId) -> RepositoryResult<usize> {
        Ok(self.read()?.tiles.get(&id).map_or(0, Vec::len))
    }

    async fn tile_containing(
        &self,
        id: LocalizationId,
        index: i64,
    ) -> RepositoryResult<Option<LocalizationTile>> {
        let data = self.read()?;
        let Some(tiles) = data.tiles.get(&id) else {
            return Ok(None);
        };
        let after = tiles.partition_point(|t| t.nested_lo <= index);
        Ok(after
            .checked_sub(1)
            .map(|i| tiles[i])
            .filter(|t| t.contains(index)))
    }

    async fn tiles_overlapping(
        &self,
        id: LocalizationId,
        ranges: &[(i64, i64)],
    ) -> RepositoryResult<Vec<LocalizationTile>> {
        let data = self.read()?;
        let Some(tiles) = data.tiles.get(&id) else {
            return Ok(Vec::new());
        };
        // Sorted, disjoint tiles have sorted upper bounds too.
        let mut hits = BTreeSet::new();
        for &(lo, hi) in ranges {
            let start = tiles.partition_point(|t| t.nested_hi < lo);
            hits.extend((start..tiles.len()).take_while(|&i| tiles[i].nested_lo <= hi));
        }
        Ok(hits.into_iter().map(|i| tiles[i]).collect())
    }

    async fn tiles_within_level(
        &self,
        id: LocalizationId,
        level: f64,
    ) -> RepositoryResult<Vec<LocalizationTile>> {
        let data = self.read()?;
        Ok(data
            .tiles
            .get(&id)
            .map(|tiles| tiles.iter().filter(|t| t.cumprob <= level).copied().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl FollowupRepository for LocalRepository {
    async fn create_followup_request(&self, new: NewFollowupRequest) -> RepositoryResult<FollowupRequest> {
        let mut data = self.write()?;
        let id = FollowupRequestId(data.next_request_id);
        data.next_request_id += 1;
        let now = Utc::now();
        let request = FollowupRequest {
            id,
            obj: new.obj,
            allocation_id: new.allocation_id,
            facility: new.facility,
            last_modified_by_id: new.requester.id,
            requester: new.requester,
            payload: new.payload,
            status: status::PENDING.to_string(),
            created_at: now,
            modified: now,
        };
        data.followups.insert(id, request.clone());
        Ok(request)
    }

    async fn get_followup_request(&self, id: FollowupRequestId) -> RepositoryResult<Option<FollowupRequest>> {
        Ok(self.read()?.followups.get(&id).cloned())
    }

    async fn update_followup_status(
        &self,
        id: FollowupRequestId,
        new_status: &str,
        modified_by: UserId,
    ) -> RepositoryResult<FollowupRequest> {
        let mut data = self.write()?;
        let request = data.followups.get_mut(&id).ok_or_else(|| {
            RepositoryError::not_found_with_context(
                "follow-up request not found",
                ErrorContext::new("update_followup_status").with_entity_id(id),
            )
        })?;
        request.status = new_status.to_string();
        request.last_modified_by_id = modified_by;
        request.modified = Utc::now();
        Ok(request.clone())
    }

    async fn delete_followup_request(&self, id: FollowupRequestId) -> RepositoryResult<bool> {
        let mut data = self.write()?;
        data.transactions.retain(|t| t.followup_request_id != id);
        Ok(data.followups.remove(&id).is_some())
    }

    async fn add_transaction(&self, new: NewFacilityTransaction) -> RepositoryResult<FacilityTransaction> {
        let mut data = self.write()?;
        if !data.followups.contains_key(&new.followup_request_id) {
            return Err(RepositoryError::not_found_with_context(
                "follow-up request not found",
                ErrorContext::new("add_transaction").with_entity_id(new.followup_request_id),
            ));
        }
        let transaction = FacilityTransaction {
            id: TransactionId(data.next_transaction_id),
            followup_request_id: new.followup_request_id,
            initiator_id: new.initiator_id,
            request: new.request,
            response: new.response,
            created_at: Utc::now(),
        };
        data.next_transaction_id += 1;
        data.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn list_transactions(&self, id: FollowupRequestId) -> RepositoryResult<Vec<FacilityTransaction>> {
        Ok(self
            .read()?
            .transactions
            .iter()
            .filter(|t| t.followup_request_id == id)
            .cloned()
            .collect())
    }
}
