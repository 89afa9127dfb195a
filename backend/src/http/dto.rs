//! Data Transfer Objects for the HTTP API.
//!
//! Query parameters use the camelCase names the web client sends
//! (`startDate`, `gcnTagKeep`, `credibleLevel`, ...).

use serde::{Deserialize, Serialize};

use crate::api::{FollowupRequestDetail, GcnEventDetail, Localization, LocalizationSummary};
use crate::services::crossmatch::Field;
use crate::services::{EventSubmission, IngestOutcome, JobKind, JobStatus, LogEntry};

/// Body of `POST /api/gcn_event`: a VOEvent notice or a JSON event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GcnEventUpload {
    VoEvent { xml: String },
    Event(EventSubmission),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub message: String,
    #[serde(flatten)]
    pub outcome: IngestOutcome,
}

/// Query parameters of `GET /api/gcn_event`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventListQuery {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    /// Comma separated tags every event must carry.
    #[serde(default)]
    pub gcn_tag_keep: Option<String>,
    /// Comma separated tags no event may carry.
    #[serde(default)]
    pub gcn_tag_remove: Option<String>,
    /// `name: value: op` conditions, comma separated.
    #[serde(default)]
    pub gcn_properties_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventListResponse {
    pub events: Vec<GcnEventDetail>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalizationQuery {
    #[serde(default, rename = "include2DMap")]
    pub include_2d_map: bool,
    #[serde(default, rename = "includeContour")]
    pub include_contour: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizationResponse {
    #[serde(flatten)]
    pub summary: LocalizationSummary,
    pub uniq: Vec<i64>,
    pub probdensity: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flat_2d: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contour: Option<serde_json::Value>,
    /// Number of stored tiles; zero until the tiling job has run.
    pub tiles: usize,
}

impl LocalizationResponse {
    pub fn new(localization: Localization, query: &LocalizationQuery, tiles: usize) -> Self {
        Self {
            summary: LocalizationSummary::from(&localization),
            uniq: localization.uniq,
            probdensity: localization.probdensity,
            flat_2d: localization.flat_2d.filter(|_| query.include_2d_map),
            contour: localization.contour.filter(|_| query.include_contour),
            tiles,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointQuery {
    pub ra: f64,
    pub dec: f64,
    #[serde(default)]
    pub credible_level: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldsRequest {
    pub fields: Vec<Field>,
    /// HEALPix order at which footprints are pixelized.
    #[serde(default)]
    pub order: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredibleRegionQuery {
    pub level: f64,
}

/// Response for work handed to the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowupDeleteResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<FollowupRequestDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Job status response for async processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    /// Job ID
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Log entries
    pub logs: Vec<LogEntry>,
    /// Result if completed
    pub result: Option<serde_json::Value>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status of the service
    pub status: String,
    /// Crate version
    pub version: String,
    /// Database connection status
    pub database: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_variants() {
        let xml: GcnEventUpload = serde_json::from_str(r#"{"xml": "<VOEvent/>"}"#).unwrap();
        assert!(matches!(xml, GcnEventUpload::VoEvent { .. }));

        let event: GcnEventUpload = serde_json::from_str(
            r#"{"dateobs": "2019-04-25T08:18:05", "tags": ["GW"], "skymap": {"ra": 1.0, "dec": 2.0, "error": 3.0}}"#,
        )
        .unwrap();
        match event {
            GcnEventUpload::Event(submission) => {
                assert_eq!(submission.tags, vec!["GW"]);
                assert!(submission.skymap.is_some());
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_query_names() {
        let query: EventListQuery =
            serde_json::from_str(r#"{"startDate": "2019-01-01", "gcnTagKeep": "GW,BNS"}"#).unwrap();
        assert_eq!(query.start_date.as_deref(), Some("2019-01-01"));
        assert_eq!(query.gcn_tag_keep.as_deref(), Some("GW,BNS"));

        let query: LocalizationQuery = serde_json::from_str(r#"{"include2DMap": true}"#).unwrap();
        assert!(query.include_2d_map);
        assert!(!query.include_contour);
    }
}
