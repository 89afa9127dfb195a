//! KPED robotic queue.
//!
//! Requests travel as an HS256 JWT whose claims are
//! `{targets: [...], user: <requester>}`, one target per requested filter.
//! The token is sent as the raw body of `PUT /api/queues` (submit) or
//! `DELETE /api/queues` (delete). Submission succeeds only on HTTP 201.

use async_trait::async_trait;
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transaction::execute;
use super::{http_client, join_url, Dispatch, FacilityError, FacilityResult, FollowupApi, TunnelPool};
use crate::api::{status, FollowupRequest};
use crate::config::KpedSettings;

/// Filters the instrument can observe in.
pub const FILTERS: [&str; 7] = ["gs", "rs", "uj", "bj", "vj", "rj", "ij"];

const PROGRAM_PI: &str = "Kulkarni";
const EPOCH: u32 = 2000;

/// Observation parameters a KPED request must carry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KpedPayload {
    pub observation_choices: Vec<String>,
    pub exposure_time: f64,
    pub exposure_counts: f64,
    #[serde(deserialize_with = "priority_text")]
    pub priority: String,
}

fn priority_text<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid priority {other}"))),
    }
}

impl KpedPayload {
    pub fn parse(payload: &Value) -> FacilityResult<Self> {
        let parsed: Self = serde_json::from_value(payload.clone())
            .map_err(|e| FacilityError::InvalidPayload(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> FacilityResult<()> {
        let invalid = |msg: String| Err(FacilityError::InvalidPayload(msg));
        if self.observation_choices.is_empty() {
            return invalid("observation_choices must not be empty".into());
        }
        for (i, filter) in self.observation_choices.iter().enumerate() {
            if !FILTERS.contains(&filter.as_str()) {
                return invalid(format!("unknown filter {filter:?}"));
            }
            if self.observation_choices[..i].contains(filter) {
                return invalid(format!("filter {filter:?} requested twice"));
            }
        }
        if !(self.exposure_time.is_finite() && self.exposure_time > 0.0) {
            return invalid(format!("exposure_time {} must be positive", self.exposure_time));
        }
        if !(self.exposure_counts >= 1.0 && self.exposure_counts.fract() == 0.0) {
            return invalid(format!(
                "exposure_counts {} must be a positive integer",
                self.exposure_counts
            ));
        }
        if !matches!(self.priority.as_str(), "1" | "2" | "3" | "4" | "5") {
            return invalid(format!("priority {:?} must be 1 to 5", self.priority));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpedTarget {
    pub id: i64,
    pub name: String,
    pub ra: f64,
    pub dec: f64,
    pub epoch: u32,
    pub exposure_time: f64,
    pub exposure_counts: u32,
    pub filter: String,
    pub priority: String,
    pub program_pi: String,
}

/// JWT claims sent to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpedClaims {
    pub targets: Vec<KpedTarget>,
    pub user: String,
}

impl KpedClaims {
    pub fn build(request: &FollowupRequest) -> FacilityResult<Self> {
        let payload = KpedPayload::parse(&request.payload)?;
        let targets = payload
            .observation_choices
            .iter()
            .map(|filter| KpedTarget {
                id: request.id.value(),
                name: request.obj.id.clone(),
                ra: request.obj.ra,
                dec: request.obj.dec,
                epoch: EPOCH,
                exposure_time: payload.exposure_time,
                exposure_counts: payload.exposure_counts as u32,
                filter: filter.clone(),
                priority: payload.priority.clone(),
                program_pi: format!("{PROGRAM_PI}/{}", request.requester.username),
            })
            .collect();
        Ok(Self {
            targets,
            user: request.requester.username.clone(),
        })
    }
}

pub struct KpedApi {
    client: reqwest::Client,
    base_url: String,
    key: EncodingKey,
    tunnel: TunnelPool,
}

impl KpedApi {
    pub fn new(base_url: impl Into<String>, secret_key: &str, timeout_secs: u64, tunnel: TunnelPool) -> FacilityResult<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url: base_url.into(),
            key: EncodingKey::from_secret(secret_key.as_bytes()),
            tunnel,
        })
    }

    pub fn from_settings(settings: &KpedSettings) -> FacilityResult<Self> {
        Self::new(
            settings.base_url.clone(),
            &settings.secret_key,
            settings.timeout_secs,
            TunnelPool::from_settings(settings.tunnel.clone()),
        )
    }

    fn token(&self, request: &FollowupRequest) -> FacilityResult<String> {
        let claims = KpedClaims::build(request)?;
        Ok(jsonwebtoken::encode(&Header::default(), &claims, &self.key)?)
    }

    async fn call(&self, method: reqwest::Method, request: &FollowupRequest) -> FacilityResult<super::HttpExchange> {
        let token = self.token(request)?;
        let url = join_url(&self.base_url, "api/queues");
        let _tunnel = self.tunnel.acquire().await?;
        execute(&self.client, self.client.request(method, url).body(token)).await
    }
}

#[async_trait]
impl FollowupApi for KpedApi {
    fn validate_payload(&self, payload: &Value) -> FacilityResult<()> {
        KpedPayload::parse(payload).map(|_| ())
    }

    async fn submit(&self, request: &FollowupRequest) -> FacilityResult<Dispatch> {
        let exchange = self.call(reqwest::Method::PUT, request).await?;
        let status = if exchange.status == 201 {
            status::SUBMITTED.to_string()
        } else {
            status::rejected(&exchange.body)
        };
        Ok(Dispatch { status, exchange })
    }

    async fn delete(&self, request: &FollowupRequest) -> FacilityResult<Dispatch> {
        let exchange = self.call(reqwest::Method::DELETE, request).await?;
        let status = if exchange.is_success() {
            status::DELETED.to_string()
        } else {
            status::rejected(&exchange.body)
        };
        Ok(Dispatch { status, exchange })
    }
}
