//! Public API surface for the backend.
//!
//! Identifier newtypes and the domain types exchanged over the REST API.
//! All types derive Serialize/Deserialize for JSON serialization.

pub use crate::models::followup::{
    status, FacilityKind, FacilityTransaction, FollowupRequest, FollowupRequestDetail,
    NewFacilityTransaction, NewFollowupRequest, Requester, TargetObject,
};
pub use crate::models::gcn::{
    Comparison, EventFilter, GcnEvent, GcnEventDetail, GcnNotice, GcnProperty, GcnTag,
    Localization, LocalizationSummary, LocalizationTile, NewGcnNotice, NewLocalization,
    PropertyFilter,
};
pub use crate::models::skymap::{Skymap, SkymapSource};
pub use crate::models::user::Principal;

crate::define_ids!(
    /// Account a token resolves to.
    UserId,
    NoticeId,
    LocalizationId,
    FollowupRequestId,
    TransactionId,
);

#[cfg(test)]
#[path = "api_tests.rs"]
mod api_tests;
