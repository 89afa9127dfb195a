//! Generic JSON scheduler queue.
//!
//! `POST {base}/requests` with the request document submits;
//! `DELETE {base}/requests/{id}` withdraws. Any 2xx response is success.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::transaction::execute;
use super::{http_client, join_url, Dispatch, FacilityError, FacilityResult, FollowupApi, HttpExchange};
use crate::api::{status, FollowupRequest};
use crate::config::JsonQueueSettings;

pub struct JsonQueueApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl JsonQueueApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout_secs: u64) -> FacilityResult<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url: base_url.into(),
            token,
        })
    }

    pub fn from_settings(settings: &JsonQueueSettings) -> FacilityResult<Self> {
        Self::new(settings.base_url.clone(), settings.token.clone(), settings.timeout_secs)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn dispatch(exchange: HttpExchange, success: &str) -> Dispatch {
        let status = if exchange.is_success() {
            success.to_string()
        } else {
            status::rejected(&exchange.body)
        };
        Dispatch { status, exchange }
    }
}

/// Document posted to the queue for a request.
pub fn request_document(request: &FollowupRequest) -> Value {
    json!({
        "id": request.id,
        "obj": request.obj,
        "allocation_id": request.allocation_id,
        "requester": request.requester.username,
        "payload": request.payload,
    })
}

#[async_trait]
impl FollowupApi for JsonQueueApi {
    fn validate_payload(&self, payload: &Value) -> FacilityResult<()> {
        if payload.is_object() {
            Ok(())
        } else {
            Err(FacilityError::InvalidPayload("payload must be a JSON object".into()))
        }
    }

    async fn submit(&self, request: &FollowupRequest) -> FacilityResult<Dispatch> {
        let url = join_url(&self.base_url, "requests");
        let builder = self.authorize(self.client.post(url).json(&request_document(request)));
        let exchange = execute(&self.client, builder).await?;
        Ok(Self::dispatch(exchange, status::SUBMITTED))
    }

    async fn delete(&self, request: &FollowupRequest) -> FacilityResult<Dispatch> {
        let url = join_url(&self.base_url, &format!("requests/{}", request.id));
        let builder = self.authorize(self.client.delete(url));
        let exchange = execute(&self.client, builder).await?;
        Ok(Self::dispatch(exchange, status::DELETED))
    }
}
