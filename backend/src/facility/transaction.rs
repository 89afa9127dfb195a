//! Audit records of facility HTTP exchanges.
//!
//! Each call to a scheduler is captured as a pair of JSON documents:
//! `{method, url, headers, body}` for the request and
//! `{status, reason, headers, body}` for the response. Credentials in
//! headers are masked before they are stored.

use reqwest::header::{HeaderMap, AUTHORIZATION, PROXY_AUTHORIZATION};
use serde_json::{json, Map, Value};

use super::{FacilityError, FacilityResult};

const MASK: &str = "********";

/// One completed request/response pair.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpExchange {
    pub status: u16,
    /// Response body as text.
    pub body: String,
    pub request: Value,
    pub response: Value,
}

impl HttpExchange {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn headers_json(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for (name, value) in headers {
        let text = if name == AUTHORIZATION || name == PROXY_AUTHORIZATION {
            MASK.to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        out.insert(name.as_str().to_string(), Value::String(text));
    }
    Value::Object(out)
}

pub fn request_record(request: &reqwest::Request) -> Value {
    let body = request
        .body()
        .and_then(|b| b.as_bytes())
        .map(|b| String::from_utf8_lossy(b).into_owned());
    json!({
        "method": request.method().as_str(),
        "url": request.url().as_str(),
        "headers": headers_json(request.headers()),
        "body": body,
    })
}

pub fn response_record(status: reqwest::StatusCode, headers: &HeaderMap, body: &str) -> Value {
    json!({
        "status": status.as_u16(),
        "reason": status.canonical_reason().unwrap_or(""),
        "headers": headers_json(headers),
        "body": body,
    })
}

/// Send a request and capture the exchange.
///
/// Only transport failures are errors; any HTTP status is returned.
pub async fn execute(client: &reqwest::Client, builder: reqwest::RequestBuilder) -> FacilityResult<HttpExchange> {
    let request = builder
        .build()
        .map_err(|e| FacilityError::Transport(format!("invalid request: {e}")))?;
    let request_json = request_record(&request);
    let target = format!("{} {}", request.method(), request.url());

    let response = client
        .execute(request)
        .await
        .map_err(|e| FacilityError::Transport(format!("{target}: {e}")))?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .text()
        .await
        .map_err(|e| FacilityError::Transport(format!("{target}: reading body: {e}")))?;
    log::debug!("{} -> {}", target, status);

    Ok(HttpExchange {
        status: status.as_u16(),
        response: response_record(status, &headers, &body),
        request: request_json,
        body,
    })
}
