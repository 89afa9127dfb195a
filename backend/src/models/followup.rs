//! Follow-up requests and the facility transactions recorded for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{FollowupRequestId, TransactionId, UserId};

/// Request status strings.
pub mod status {
    pub const PENDING: &str = "pending submission";
    pub const SUBMITTED: &str = "submitted";
    pub const DELETED: &str = "deleted";

    const REJECTED_PREFIX: &str = "rejected: ";

    pub fn rejected(body: &str) -> String {
        format!("{REJECTED_PREFIX}{body}")
    }

    pub fn is_rejected(status: &str) -> bool {
        status.starts_with(REJECTED_PREFIX.trim_end())
    }
}

/// External schedulers requests can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityKind {
    Kped,
    JsonQueue,
}

impl FacilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FacilityKind::Kped => "kped",
            FacilityKind::JsonQueue => "json_queue",
        }
    }
}

impl std::fmt::Display for FacilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FacilityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kped" => Ok(FacilityKind::Kped),
            "json_queue" => Ok(FacilityKind::JsonQueue),
            other => Err(format!("unknown facility {other:?}")),
        }
    }
}

/// Sky object a request targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetObject {
    pub id: String,
    pub ra: f64,
    pub dec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupRequest {
    pub id: FollowupRequestId,
    pub obj: TargetObject,
    pub allocation_id: Option<i64>,
    pub facility: FacilityKind,
    pub requester: Requester,
    /// Facility-specific observation parameters.
    pub payload: serde_json::Value,
    pub status: String,
    pub last_modified_by_id: UserId,
    pub created_at: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFollowupRequest {
    pub obj: TargetObject,
    pub allocation_id: Option<i64>,
    pub facility: FacilityKind,
    pub requester: Requester,
    pub payload: serde_json::Value,
}

/// Audit record of one HTTP exchange with a facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityTransaction {
    pub id: TransactionId,
    pub followup_request_id: FollowupRequestId,
    pub initiator_id: UserId,
    /// `{method, url, headers, body}`
    pub request: serde_json::Value,
    /// `{status, reason, headers, body}`
    pub response: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFacilityTransaction {
    pub followup_request_id: FollowupRequestId,
    pub initiator_id: UserId,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupRequestDetail {
    #[serde(flatten)]
    pub request: FollowupRequest,
    pub transactions: Vec<FacilityTransaction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_helpers() {
        let rejected = status::rejected("queue full");
        assert_eq!(rejected, "rejected: queue full");
        assert!(status::is_rejected(&rejected));
        assert!(status::is_rejected("rejected:"));
        assert!(!status::is_rejected(status::SUBMITTED));
    }

    #[test]
    fn test_facility_kind_round_trip() {
        for kind in [FacilityKind::Kped, FacilityKind::JsonQueue] {
            assert_eq!(kind.as_str().parse::<FacilityKind>().unwrap(), kind);
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::json!(kind.as_str()));
        }
        assert!("lco".parse::<FacilityKind>().is_err());
    }
}
