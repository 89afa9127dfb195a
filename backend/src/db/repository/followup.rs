//! Repository trait for follow-up requests.

use async_trait::async_trait;

use super::error::RepositoryResult;
use crate::api::{
    FacilityTransaction, FollowupRequest, FollowupRequestId, NewFacilityTransaction,
    NewFollowupRequest, UserId,
};

#[async_trait]
pub trait FollowupRepository: Send + Sync {
    /// Insert a request with status `pending submission`.
    async fn create_followup_request(&self, new: NewFollowupRequest) -> RepositoryResult<FollowupRequest>;

    async fn get_followup_request(&self, id: FollowupRequestId) -> RepositoryResult<Option<FollowupRequest>>;

    /// Set the status string and record who changed it.
    async fn update_followup_status(
        &self,
        id: FollowupRequestId,
        status: &str,
        modified_by: UserId,
    ) -> RepositoryResult<FollowupRequest>;

    /// Delete a request and its transactions.
    async fn delete_followup_request(&self, id: FollowupRequestId) -> RepositoryResult<bool>;

    async fn add_transaction(&self, new: NewFacilityTransaction) -> RepositoryResult<FacilityTransaction>;

    /// Transactions of a request, oldest first.
    async fn list_transactions(&self, id: FollowupRequestId) -> RepositoryResult<Vec<FacilityTransaction>>;
}
