//! Dispatch of follow-up requests to external facility schedulers.
//!
//! Every supported scheduler implements [`FollowupApi`]; the closed set of
//! them is the [`Facility`] enum. A submit or delete makes exactly one HTTP
//! call and returns the new request status together with the recorded
//! exchange. A response the scheduler did not accept is a status
//! (`rejected: <body>`), not an error; only transport failures are errors.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::{FacilityKind, FollowupRequest};
use crate::config::FacilitiesConfig;

pub mod json_queue;
pub mod kped;
pub mod transaction;
pub mod tunnel;

pub use json_queue::JsonQueueApi;
pub use kped::KpedApi;
pub use transaction::HttpExchange;
pub use tunnel::{TunnelGuard, TunnelPool};

#[derive(Debug, thiserror::Error)]
pub enum FacilityError {
    #[error("facility transport error: {0}")]
    Transport(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("facility {0} is not configured")]
    NotConfigured(FacilityKind),
    #[error("failed to sign payload: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("ssh tunnel error: {0}")]
    Tunnel(String),
}

pub type FacilityResult<T> = Result<T, FacilityError>;

/// Result of one scheduler call.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Status the request should move to.
    pub status: String,
    pub exchange: HttpExchange,
}

#[async_trait]
pub trait FollowupApi: Send + Sync {
    /// Check a request payload before the request is stored.
    fn validate_payload(&self, _payload: &Value) -> FacilityResult<()> {
        Ok(())
    }

    async fn submit(&self, request: &FollowupRequest) -> FacilityResult<Dispatch>;

    async fn delete(&self, request: &FollowupRequest) -> FacilityResult<Dispatch>;
}

pub(crate) fn http_client(timeout_secs: u64) -> FacilityResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| FacilityError::Transport(format!("failed to build HTTP client: {e}")))
}

/// Join a base URL and a path without doubling or dropping the slash.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

pub enum Facility {
    Kped(KpedApi),
    JsonQueue(JsonQueueApi),
}

impl Facility {
    pub fn kind(&self) -> FacilityKind {
        match self {
            Facility::Kped(_) => FacilityKind::Kped,
            Facility::JsonQueue(_) => FacilityKind::JsonQueue,
        }
    }
}

#[async_trait]
impl FollowupApi for Facility {
    fn validate_payload(&self, payload: &Value) -> FacilityResult<()> {
        match self {
            Facility::Kped(api) => api.validate_payload(payload),
            Facility::JsonQueue(api) => api.validate_payload(payload),
        }
    }

    async fn submit(&self, request: &FollowupRequest) -> FacilityResult<Dispatch> {
        match self {
            Facility::Kped(api) => api.submit(request).await,
            Facility::JsonQueue(api) => api.submit(request).await,
        }
    }

    async fn delete(&self, request: &FollowupRequest) -> FacilityResult<Dispatch> {
        match self {
            Facility::Kped(api) => api.delete(request).await,
            Facility::JsonQueue(api) => api.delete(request).await,
        }
    }
}

/// The configured facilities, by kind.
#[derive(Default)]
pub struct FacilityRegistry {
    facilities: HashMap<FacilityKind, Facility>,
}

impl FacilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &FacilitiesConfig) -> FacilityResult<Self> {
        let mut registry = Self::new();
        if let Some(settings) = &config.kped {
            registry.register(Facility::Kped(KpedApi::from_settings(settings)?));
        }
        if let Some(settings) = &config.json_queue {
            registry.register(Facility::JsonQueue(JsonQueueApi::from_settings(settings)?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, facility: Facility) {
        log::info!("Facility {} enabled", facility.kind());
        self.facilities.insert(facility.kind(), facility);
    }

    pub fn get(&self, kind: FacilityKind) -> FacilityResult<&Facility> {
        self.facilities
            .get(&kind)
            .ok_or(FacilityError::NotConfigured(kind))
    }

    pub fn kinds(&self) -> Vec<FacilityKind> {
        let mut kinds: Vec<_> = self.facilities.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}
