use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

use super::schema::{
    facilitytransactions, followuprequests, gcnevents, gcnnotices, gcnproperties, gcntags,
    localizations, localizationtiles,
};
use crate::api::{
    FacilityTransaction, FollowupRequest, FollowupRequestId, GcnEvent, GcnNotice, Localization,
    LocalizationId, LocalizationTile, NoticeId, Requester, TargetObject, TransactionId, UserId,
};
use crate::db::repository::{RepositoryError, RepositoryResult};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = gcnevents)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct GcnEventRow {
    pub dateobs: DateTime<Utc>,
    pub sent_by_id: i64,
    pub created_at: DateTime<Utc>,
}

impl From<GcnEventRow> for GcnEvent {
    fn from(row: GcnEventRow) -> Self {
        GcnEvent {
            dateobs: row.dateobs,
            sent_by_id: UserId(row.sent_by_id),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = gcnevents)]
pub struct NewGcnEventRow {
    pub dateobs: DateTime<Utc>,
    pub sent_by_id: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = gcnnotices)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct GcnNoticeRow {
    pub id: i64,
    pub dateobs: DateTime<Utc>,
    pub ivorn: String,
    pub notice_type: Option<i32>,
    pub stream: String,
    pub date: Option<DateTime<Utc>>,
    pub content: String,
    pub checksum: String,
    pub sent_by_id: i64,
    pub created_at: DateTime<Utc>,
}

impl From<GcnNoticeRow> for GcnNotice {
    fn from(row: GcnNoticeRow) -> Self {
        GcnNotice {
            id: NoticeId(row.id),
            dateobs: row.dateobs,
            ivorn: row.ivorn,
            notice_type: row.notice_type,
            stream: row.stream,
            date: row.date,
            content: row.content,
            checksum: row.checksum,
            sent_by_id: UserId(row.sent_by_id),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = gcnnotices)]
pub struct NewGcnNoticeRow {
    pub dateobs: DateTime<Utc>,
    pub ivorn: String,
    pub notice_type: Option<i32>,
    pub stream: String,
    pub date: Option<DateTime<Utc>>,
    pub content: String,
    pub checksum: String,
    pub sent_by_id: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = gcntags)]
pub struct NewGcnTagRow {
    pub dateobs: DateTime<Utc>,
    pub text: String,
    pub sent_by_id: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = gcnproperties)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[allow(dead_code)] // id is only used for ordering
pub struct GcnPropertyRow {
    pub id: i64,
    pub dateobs: DateTime<Utc>,
    pub data: Value,
    pub sent_by_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = gcnproperties)]
pub struct NewGcnPropertyRow {
    pub dateobs: DateTime<Utc>,
    pub data: Value,
    pub sent_by_id: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = localizations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct LocalizationRow {
    pub id: i64,
    pub dateobs: DateTime<Utc>,
    pub localization_name: String,
    pub uniq: Vec<i64>,
    pub probdensity: Vec<f64>,
    pub flat_2d: Option<Vec<f64>>,
    pub contour: Option<Value>,
    pub sent_by_id: i64,
    pub created_at: DateTime<Utc>,
}

impl From<LocalizationRow> for Localization {
    fn from(row: LocalizationRow) -> Self {
        Localization {
            id: LocalizationId(row.id),
            dateobs: row.dateobs,
            localization_name: row.localization_name,
            uniq: row.uniq,
            probdensity: row.probdensity,
            flat_2d: row.flat_2d,
            contour: row.contour,
            sent_by_id: UserId(row.sent_by_id),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = localizations)]
pub struct NewLocalizationRow {
    pub dateobs: DateTime<Utc>,
    pub localization_name: String,
    pub uniq: Vec<i64>,
    pub probdensity: Vec<f64>,
    pub sent_by_id: i64,
}

#[derive(Debug, Clone, Copy, Queryable, QueryableByName, Selectable, Insertable)]
#[diesel(table_name = localizationtiles)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct LocalizationTileRow {
    pub localization_id: i64,
    pub nested_lo: i64,
    pub nested_hi: i64,
    pub probdensity: f64,
    pub cumprob: f64,
}

impl From<LocalizationTileRow> for LocalizationTile {
    fn from(row: LocalizationTileRow) -> Self {
        LocalizationTile {
            localization_id: LocalizationId(row.localization_id),
            nested_lo: row.nested_lo,
            nested_hi: row.nested_hi,
            probdensity: row.probdensity,
            cumprob: row.cumprob,
        }
    }
}

impl From<&LocalizationTile> for LocalizationTileRow {
    fn from(tile: &LocalizationTile) -> Self {
        LocalizationTileRow {
            localization_id: tile.localization_id.0,
            nested_lo: tile.nested_lo,
            nested_hi: tile.nested_hi,
            probdensity: tile.probdensity,
            cumprob: tile.cumprob,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = followuprequests)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FollowupRequestRow {
    pub id: i64,
    pub obj_id: String,
    pub obj_ra: f64,
    pub obj_dec: f64,
    pub allocation_id: Option<i64>,
    pub facility: String,
    pub requester_id: i64,
    pub requester_username: String,
    pub payload: Value,
    pub status: String,
    pub last_modified_by_id: i64,
    pub created_at: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl TryFrom<FollowupRequestRow> for FollowupRequest {
    type Error = RepositoryError;

    fn try_from(row: FollowupRequestRow) -> RepositoryResult<Self> {
        let facility = row.facility.parse().map_err(|e: String| {
            RepositoryError::internal(format!("followup request {}: {e}", row.id))
        })?;
        Ok(FollowupRequest {
            id: FollowupRequestId(row.id),
            obj: TargetObject {
                id: row.obj_id,
                ra: row.obj_ra,
                dec: row.obj_dec,
            },
            allocation_id: row.allocation_id,
            facility,
            requester: Requester {
                id: UserId(row.requester_id),
                username: row.requester_username,
            },
            payload: row.payload,
            status: row.status,
            last_modified_by_id: UserId(row.last_modified_by_id),
            created_at: row.created_at,
            modified: row.modified,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = followuprequests)]
pub struct NewFollowupRequestRow {
    pub obj_id: String,
    pub obj_ra: f64,
    pub obj_dec: f64,
    pub allocation_id: Option<i64>,
    pub facility: String,
    pub requester_id: i64,
    pub requester_username: String,
    pub payload: Value,
    pub status: String,
    pub last_modified_by_id: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = facilitytransactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FacilityTransactionRow {
    pub id: i64,
    pub followup_request_id: i64,
    pub initiator_id: i64,
    pub request: Value,
    pub response: Value,
    pub created_at: DateTime<Utc>,
}

impl From<FacilityTransactionRow> for FacilityTransaction {
    fn from(row: FacilityTransactionRow) -> Self {
        FacilityTransaction {
            id: TransactionId(row.id),
            followup_request_id: FollowupRequestId(row.followup_request_id),
            initiator_id: UserId(row.initiator_id),
            request: row.request,
            response: row.response,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = facilitytransactions)]
pub struct NewFacilityTransactionRow {
    pub followup_request_id: i64,
    pub initiator_id: i64,
    pub request: Value,
    pub response: Value,
}
