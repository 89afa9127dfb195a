//! Follow-up request lifecycle.
//!
//! Creating a request stores it as `pending submission` and submits it to
//! its facility right away. Every facility call is recorded as a
//! transaction before the status changes. A facility that cannot be reached
//! leaves the status untouched and surfaces as an error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::api::{
    status, FacilityKind, FollowupRequest, FollowupRequestDetail, FollowupRequestId,
    NewFacilityTransaction, NewFollowupRequest, Principal, Requester, TargetObject,
};
use crate::db::{FollowupRepository, FullRepository, RepositoryError};
use crate::facility::{Dispatch, FacilityError, FacilityRegistry, FollowupApi};

#[derive(Debug, thiserror::Error)]
pub enum FollowupError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Facility(#[from] FacilityError),
    #[error("follow-up request {0} not found")]
    NotFound(FollowupRequestId),
    #[error("Insufficient permissions: {0}")]
    Forbidden(String),
}

pub type FollowupResult<T> = Result<T, FollowupError>;

/// Body of a new follow-up request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupSubmission {
    pub obj: TargetObject,
    #[serde(default)]
    pub allocation_id: Option<i64>,
    pub facility: FacilityKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// How a delete was carried out.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// Never reached the facility; the row was removed.
    RemovedLocally,
    /// The facility was asked to withdraw it; the row keeps the new status.
    Dispatched(FollowupRequestDetail),
}

#[derive(Clone)]
pub struct FollowupService {
    repo: Arc<dyn FullRepository>,
    facilities: Arc<FacilityRegistry>,
}

impl FollowupService {
    pub fn new(repo: Arc<dyn FullRepository>, facilities: Arc<FacilityRegistry>) -> Self {
        Self { repo, facilities }
    }

    /// Store a request and submit it to its facility.
    pub async fn create(
        &self,
        submission: FollowupSubmission,
        principal: &Principal,
    ) -> FollowupResult<FollowupRequestDetail> {
        let facility = self.facilities.get(submission.facility)?;
        facility.validate_payload(&submission.payload)?;

        let request = self
            .repo
            .create_followup_request(NewFollowupRequest {
                obj: submission.obj,
                allocation_id: submission.allocation_id,
                facility: submission.facility,
                requester: Requester {
                    id: principal.id,
                    username: principal.username.clone(),
                },
                payload: submission.payload,
            })
            .await?;
        log::info!(
            "Submitting follow-up request {} for {} to {}",
            request.id,
            request.obj.id,
            request.facility
        );

        let dispatch = facility.submit(&request).await.map_err(|e| {
            log::warn!("Submission of request {} failed: {}", request.id, e);
            e
        })?;
        self.record(&request, dispatch, principal).await?;
        self.detail(request.id).await
    }

    pub async fn get(&self, id: FollowupRequestId) -> FollowupResult<FollowupRequestDetail> {
        self.detail(id).await
    }

    /// Withdraw a request from its facility.
    ///
    /// A request with no recorded transaction never reached the facility and
    /// is deleted locally without any remote call.
    pub async fn delete(&self, id: FollowupRequestId, principal: &Principal) -> FollowupResult<DeleteOutcome> {
        let request = self
            .repo
            .get_followup_request(id)
            .await?
            .ok_or(FollowupError::NotFound(id))?;
        if !principal.can_modify(request.requester.id) {
            return Err(FollowupError::Forbidden(
                "follow-up requests can only be deleted by their requester".into(),
            ));
        }

        if self.repo.list_transactions(id).await?.is_empty() {
            self.repo.delete_followup_request(id).await?;
            log::info!("Deleted unsubmitted follow-up request {}", id);
            return Ok(DeleteOutcome::RemovedLocally);
        }

        let facility = self.facilities.get(request.facility)?;
        let dispatch = facility.delete(&request).await?;
        self.record(&request, dispatch, principal).await?;
        Ok(DeleteOutcome::Dispatched(self.detail(id).await?))
    }

    async fn record(
        &self,
        request: &FollowupRequest,
        dispatch: Dispatch,
        principal: &Principal,
    ) -> FollowupResult<()> {
        self.repo
            .add_transaction(NewFacilityTransaction {
                followup_request_id: request.id,
                initiator_id: principal.id,
                request: dispatch.exchange.request,
                response: dispatch.exchange.response,
            })
            .await?;
        if status::is_rejected(&dispatch.status) {
            log::warn!("Facility {} rejected request {}", request.facility, request.id);
        }
        self.repo
            .update_followup_status(request.id, &dispatch.status, principal.id)
            .await?;
        Ok(())
    }

    async fn detail(&self, id: FollowupRequestId) -> FollowupResult<FollowupRequestDetail> {
        let request = self
            .repo
            .get_followup_request(id)
            .await?
            .ok_or(FollowupError::NotFound(id))?;
        let transactions = self.repo.list_transactions(id).await?;
        Ok(FollowupRequestDetail { request, transactions })
    }
}
