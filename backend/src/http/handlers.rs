//! HTTP handlers for the REST API.
//!
//! Each handler corresponds to an API endpoint and delegates to the
//! service layer for business logic.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;

use super::auth::AuthUser;
use super::dto::{
    CredibleRegionQuery, EventListQuery, EventListResponse, FieldsRequest, FollowupDeleteResponse,
    GcnEventUpload, HealthResponse, IngestResponse, JobAccepted, JobStatusResponse,
    LocalizationQuery, LocalizationResponse, MessageResponse, PointQuery,
};
use super::error::AppError;
use super::state::AppState;
use crate::api::{
    EventFilter, FollowupRequestDetail, FollowupRequestId, GcnEventDetail, Localization,
    PropertyFilter,
};
use crate::db::{EventRepository, LocalizationRepository};
use crate::models::gcn::{format_dateobs, parse_dateobs};
use crate::services::crossmatch::{self, CredibleRegion, FieldsMatch, PointMatch};
use crate::services::{DeleteOutcome, FollowupSubmission};

/// Result type for handlers.
pub type HandlerResult<T> = Result<Json<T>, AppError>;

fn dateobs_param(text: &str) -> Result<DateTime<Utc>, AppError> {
    parse_dateobs(text).ok_or_else(|| AppError::BadRequest(format!("Invalid dateobs: {text}")))
}

fn comma_list(text: Option<&str>) -> Vec<String> {
    text.map(|t| {
        t.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

async fn find_localization(state: &AppState, dateobs: &str, name: &str) -> Result<Localization, AppError> {
    let dateobs = dateobs_param(dateobs)?;
    state
        .repository
        .find_localization(dateobs, name)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Localization {} of {} not found",
                name,
                format_dateobs(&dateobs)
            ))
        })
}

// =============================================================================
// Health Check
// =============================================================================

/// GET /health
///
/// Health check endpoint to verify the service is running and database is accessible.
pub async fn health_check(State(state): State<AppState>) -> HandlerResult<HealthResponse> {
    let db_status = match state.repository.health_check().await {
        Ok(true) => "connected".to_string(),
        Ok(false) => "disconnected".to_string(),
        Err(e) => format!("error: {}", e),
    };

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_status,
    }))
}

// =============================================================================
// GCN events
// =============================================================================

/// POST /api/gcn_event
///
/// Ingest a VOEvent notice (`{"xml": ...}`) or a JSON event. A new
/// localization is answered with 202 and the ids of its tiling and contour
/// jobs.
pub async fn post_gcn_event(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Json(upload): Json<GcnEventUpload>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let outcome = match upload {
        GcnEventUpload::VoEvent { xml } => state.ingestor.ingest_voevent(&xml, &principal).await?,
        GcnEventUpload::Event(submission) => state.ingestor.ingest_submission(submission, &principal).await?,
    };

    let status = if outcome.job_ids.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(IngestResponse {
            message: outcome.message().to_string(),
            outcome,
        }),
    ))
}

/// GET /api/gcn_event
pub async fn list_gcn_events(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<EventListQuery>,
) -> HandlerResult<EventListResponse> {
    let filter = EventFilter {
        start_date: query.start_date.as_deref().map(dateobs_param).transpose()?,
        end_date: query.end_date.as_deref().map(dateobs_param).transpose()?,
        tag_keep: comma_list(query.gcn_tag_keep.as_deref()),
        tag_remove: comma_list(query.gcn_tag_remove.as_deref()),
        properties: query
            .gcn_properties_filter
            .as_deref()
            .map(PropertyFilter::parse_list)
            .transpose()
            .map_err(|e| AppError::BadRequest(format!("Invalid gcnPropertiesFilter: {e}")))?
            .unwrap_or_default(),
    };

    let events = state.repository.list_events(&filter).await?;
    let total = events.len();
    Ok(Json(EventListResponse { events, total }))
}

/// GET /api/gcn_event/{dateobs}
pub async fn get_gcn_event(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(dateobs): Path<String>,
) -> HandlerResult<GcnEventDetail> {
    let dateobs = dateobs_param(&dateobs)?;
    let detail = state
        .repository
        .get_event_detail(dateobs)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Event {} not found", format_dateobs(&dateobs))))?;
    Ok(Json(detail))
}

/// DELETE /api/gcn_event/{dateobs}
///
/// Removes the event with its notices, tags, properties, localizations and
/// tiles.
pub async fn delete_gcn_event(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path(dateobs): Path<String>,
) -> HandlerResult<MessageResponse> {
    let dateobs = dateobs_param(&dateobs)?;
    let event = state
        .repository
        .get_event(dateobs)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Event {} not found", format_dateobs(&dateobs))))?;
    if !principal.can_modify(event.sent_by_id) {
        return Err(AppError::Forbidden(
            "Insufficient permissions: GCN event can only be deleted by original poster".into(),
        ));
    }

    state.repository.delete_event(dateobs).await?;
    tracing::info!(dateobs = %format_dateobs(&dateobs), user = %principal.username, "deleted GCN event");
    Ok(Json(MessageResponse::new(format!(
        "Deleted event {}",
        format_dateobs(&dateobs)
    ))))
}

// =============================================================================
// Localizations
// =============================================================================

/// GET /api/localization/{dateobs}/name/{name}
pub async fn get_localization(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((dateobs, name)): Path<(String, String)>,
    Query(query): Query<LocalizationQuery>,
) -> HandlerResult<LocalizationResponse> {
    let localization = find_localization(&state, &dateobs, &name).await?;
    let tiles = state.repository.count_tiles(localization.id).await?;
    Ok(Json(LocalizationResponse::new(localization, &query, tiles)))
}

/// DELETE /api/localization/{dateobs}/name/{name}
pub async fn delete_localization(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path((dateobs, name)): Path<(String, String)>,
) -> HandlerResult<MessageResponse> {
    let localization = find_localization(&state, &dateobs, &name).await?;
    if !principal.can_modify(localization.sent_by_id) {
        return Err(AppError::Forbidden(
            "Insufficient permissions: localization can only be deleted by original poster".into(),
        ));
    }

    state.repository.delete_localization(localization.id).await?;
    Ok(Json(MessageResponse::new(format!(
        "Deleted localization {}",
        localization.localization_name
    ))))
}

/// POST /api/localization/{dateobs}/name/{name}/tiles
///
/// Re-run the tiling of a stored localization. Returns a job ID for
/// tracking progress.
pub async fn retile_localization(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path((dateobs, name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let localization = find_localization(&state, &dateobs, &name).await?;
    if !principal.can_modify(localization.sent_by_id) {
        return Err(AppError::Forbidden(
            "Insufficient permissions: localization can only be retiled by original poster".into(),
        ));
    }

    let job_id = state.ingestor.enqueue_tiling(localization.id);
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            message: format!("Tiling started. Track progress at /api/jobs/{}/logs", job_id),
            job_id,
        }),
    ))
}

/// GET /api/localization/{dateobs}/name/{name}/point
pub async fn point_query(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((dateobs, name)): Path<(String, String)>,
    Query(query): Query<PointQuery>,
) -> HandlerResult<PointMatch> {
    let localization = find_localization(&state, &dateobs, &name).await?;
    let found = crossmatch::point_query(
        state.repository.as_ref(),
        localization.id,
        query.ra,
        query.dec,
        query.credible_level,
    )
    .await?;
    found.map(Json).ok_or_else(|| {
        AppError::NotFound(format!(
            "({}, {}) is outside localization {}",
            query.ra, query.dec, localization.localization_name
        ))
    })
}

/// POST /api/localization/{dateobs}/name/{name}/fields
pub async fn fields_query(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((dateobs, name)): Path<(String, String)>,
    Json(request): Json<FieldsRequest>,
) -> HandlerResult<FieldsMatch> {
    let localization = find_localization(&state, &dateobs, &name).await?;
    let result = crossmatch::fields_query(
        state.repository.as_ref(),
        localization.id,
        &request.fields,
        request.order,
    )
    .await?;
    Ok(Json(result))
}

/// GET /api/localization/{dateobs}/name/{name}/credible_region
pub async fn credible_region(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((dateobs, name)): Path<(String, String)>,
    Query(query): Query<CredibleRegionQuery>,
) -> HandlerResult<CredibleRegion> {
    let localization = find_localization(&state, &dateobs, &name).await?;
    let region = crossmatch::credible_region(state.repository.as_ref(), localization.id, query.level).await?;
    Ok(Json(region))
}

// =============================================================================
// Follow-up requests
// =============================================================================

/// POST /api/followup_request
///
/// Store the request and submit it to its facility. A refusal by the
/// facility is reported through the request status, not as an error.
pub async fn create_followup_request(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Json(submission): Json<FollowupSubmission>,
) -> HandlerResult<FollowupRequestDetail> {
    let detail = state.followups.create(submission, &principal).await?;
    Ok(Json(detail))
}

/// GET /api/followup_request/{id}
pub async fn get_followup_request(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<FollowupRequestId>,
) -> HandlerResult<FollowupRequestDetail> {
    let detail = state.followups.get(id).await?;
    Ok(Json(detail))
}

/// DELETE /api/followup_request/{id}
pub async fn delete_followup_request(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path(id): Path<FollowupRequestId>,
) -> HandlerResult<FollowupDeleteResponse> {
    let response = match state.followups.delete(id, &principal).await? {
        DeleteOutcome::RemovedLocally => FollowupDeleteResponse {
            message: format!("Deleted follow-up request {id}"),
            request: None,
        },
        DeleteOutcome::Dispatched(detail) => FollowupDeleteResponse {
            message: format!("Follow-up request {id}: {}", detail.request.status),
            request: Some(detail),
        },
    };
    Ok(Json(response))
}

// =============================================================================
// Job Management
// =============================================================================

/// GET /api/jobs/{job_id}
///
/// Get the current status and logs of a background job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> HandlerResult<JobStatusResponse> {
    let job = state
        .jobs
        .tracker()
        .get_job(&job_id)
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

    Ok(Json(JobStatusResponse {
        job_id: job.job_id,
        kind: job.kind,
        status: job.status,
        logs: job.logs,
        result: job.result,
    }))
}

/// GET /api/jobs/{job_id}/logs
///
/// Stream job logs via Server-Sent Events (SSE).
pub async fn stream_job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let tracker = state.jobs.tracker().clone();
    if tracker.get_job(&job_id).is_none() {
        return Err(AppError::NotFound(format!("Job {} not found", job_id)));
    }

    let stream = async_stream::stream! {
        let mut sent = 0;

        while let Some(progress) = tracker.logs_since(&job_id, sent) {
            sent += progress.entries.len();
            for entry in &progress.entries {
                if let Ok(data) = serde_json::to_string(entry) {
                    yield Ok(Event::default().event("log").data(data));
                }
            }

            if progress.status.is_finished() {
                let summary = serde_json::json!({
                    "status": progress.status,
                    "result": progress.result,
                });
                yield Ok(Event::default().event("complete").data(summary.to_string()));
                break;
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(1))
            .text("keep-alive"),
    ))
}
