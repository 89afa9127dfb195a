//! REST API tests driving the router in-process.

#![cfg(feature = "http-server")]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use skyportal_rust::config::AppConfig;
use skyportal_rust::db::{FullRepository, LocalRepository};
use skyportal_rust::http::{create_router, AppState};
use skyportal_rust::services::JobStatus;

const FERMI_GND_POS: &str = include_str!("data/GRB180116_Fermi_GBM_Gnd_Pos.xml");
const DATEOBS: &str = "2018-01-16T00:36:53";
const LOCALIZATION: &str = "214.74000_28.14000_11.19000";

const CONFIG: &str = r#"
[[tokens]]
token = "owner-token"
user_id = 1
username = "owner"

[[tokens]]
token = "other-token"
user_id = 2
username = "other"

[[tokens]]
token = "admin-token"
user_id = 3
username = "admin"
is_admin = true
"#;

struct TestApp {
    router: Router,
    state: AppState,
}

impl TestApp {
    fn new() -> Self {
        let config = AppConfig::from_toml(CONFIG).unwrap();
        let repo = Arc::new(LocalRepository::new()) as Arc<dyn FullRepository>;
        let state = AppState::new(repo, &config).unwrap();
        Self {
            router: create_router(state.clone()),
            state,
        }
    }

    async fn send(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("token {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn json(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let (status, text) = self.send(method, uri, token, body).await;
        let value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        (status, value)
    }

    /// Ingest the Fermi notice and wait for its jobs.
    async fn ingest(&self) -> Value {
        let (status, body) = self
            .json("POST", "/api/gcn_event", Some("owner-token"), Some(json!({"xml": FERMI_GND_POS})))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        for job_id in body["job_ids"].as_array().unwrap() {
            let job = self.state.jobs.wait_for(job_id.as_str().unwrap()).await.unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        body
    }
}

fn localization_uri(suffix: &str) -> String {
    format!("/api/localization/{DATEOBS}/name/{LOCALIZATION}{suffix}")
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new();
    let (status, body) = app.json("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "connected");
}

#[tokio::test]
async fn test_missing_or_unknown_token() {
    let app = TestApp::new();
    let (status, body) = app.json("GET", "/api/gcn_event", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = app.json("GET", "/api/gcn_event", Some("nope"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_ingest_then_read_back() {
    let app = TestApp::new();
    let body = app.ingest().await;
    assert_eq!(body["message"], "Localization queued for tiling");
    assert_eq!(body["dateobs"], DATEOBS);
    assert_eq!(body["localization"]["localization_name"], LOCALIZATION);

    let (status, event) = app
        .json("GET", &format!("/api/gcn_event/{DATEOBS}"), Some("other-token"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["tags"], json!(["Fermi", "GRB"]));
    assert_eq!(event["notices"].as_array().unwrap().len(), 1);

    // Same notice again: nothing new.
    let (status, again) = app
        .json("POST", "/api/gcn_event", Some("owner-token"), Some(json!({"xml": FERMI_GND_POS})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["message"], "Localization already exists");
}

#[tokio::test]
async fn test_event_list_filters() {
    let app = TestApp::new();
    app.ingest().await;

    let (status, list) = app
        .json("GET", "/api/gcn_event?gcnTagKeep=GRB", Some("owner-token"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);

    let (_, list) = app
        .json("GET", "/api/gcn_event?gcnTagRemove=Fermi,GW", Some("owner-token"), None)
        .await;
    assert_eq!(list["total"], 0);

    let (_, list) = app
        .json("GET", "/api/gcn_event?startDate=2019-01-01T00:00:00", Some("owner-token"), None)
        .await;
    assert_eq!(list["total"], 0);

    let (status, _) = app
        .json("GET", "/api/gcn_event?gcnPropertiesFilter=BNS:oops", Some("owner-token"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_localization_and_queries() {
    let app = TestApp::new();
    app.ingest().await;

    let (status, loc) = app.json("GET", &localization_uri(""), Some("owner-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(loc["tiles"].as_u64().unwrap() > 0);
    assert!(loc.get("flat_2d").is_none());

    let (_, loc) = app
        .json(
            "GET",
            &localization_uri("?include2DMap=true&includeContour=true"),
            Some("owner-token"),
            None,
        )
        .await;
    assert!(loc["flat_2d"].is_array());
    assert_eq!(loc["contour"]["type"], "FeatureCollection");

    let (status, point) = app
        .json(
            "GET",
            &localization_uri("/point?ra=214.74&dec=28.14&credibleLevel=0.9"),
            Some("owner-token"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(point["in_credible_region"], true);

    let (status, region) = app
        .json("GET", &localization_uri("/credible_region?level=0.9"), Some("owner-token"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(region["area"].as_f64().unwrap() > 0.0);

    let (status, _) = app
        .json("GET", &localization_uri("/credible_region?level=2"), Some("owner-token"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let fields = json!({
        "fields": [{"polygon": [[210.0, 24.0], [219.0, 24.0], [219.0, 32.0], [210.0, 32.0]]}]
    });
    let (status, overlap) = app
        .json("POST", &localization_uri("/fields"), Some("owner-token"), Some(fields))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(overlap["probability"].as_f64().unwrap() > 0.0);

    let (status, _) = app
        .json(
            "GET",
            "/api/localization/2018-01-16T00:36:53/name/missing",
            Some("owner-token"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retile_returns_job() {
    let app = TestApp::new();
    app.ingest().await;

    let (status, accepted) = app
        .json("POST", &localization_uri("/tiles"), Some("other-token"), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(accepted["code"], "FORBIDDEN");

    let (status, accepted) = app
        .json("POST", &localization_uri("/tiles"), Some("owner-token"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = accepted["job_id"].as_str().unwrap().to_string();
    app.state.jobs.wait_for(&job_id).await.unwrap();

    let (status, job) = app.json("GET", &format!("/api/jobs/{job_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["kind"], "tiling");
    assert_eq!(job["status"], "completed");

    let (status, logs) = app.send("GET", &format!("/api/jobs/{job_id}/logs"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(logs.contains(r#""status":"completed""#));

    let (status, _) = app.json("GET", "/api/jobs/unknown", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_event_permissions() {
    let app = TestApp::new();
    app.ingest().await;
    let uri = format!("/api/gcn_event/{DATEOBS}");

    let (status, body) = app.json("DELETE", &uri, Some("other-token"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["message"].as_str().unwrap().contains("Insufficient permissions"));

    let (status, _) = app.json("DELETE", &uri, Some("admin-token"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.json("GET", &uri, Some("owner-token"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app.json("GET", &localization_uri(""), Some("owner-token"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bad_input() {
    let app = TestApp::new();

    let (status, _) = app
        .json("POST", "/api/gcn_event", Some("owner-token"), Some(json!({"xml": "<VOEvent"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .json("GET", "/api/gcn_event/not-a-date", Some("owner-token"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let followup = json!({
        "obj": {"id": "ZTF19aarzaod", "ra": 197.45, "dec": -23.38},
        "facility": "kped",
        "payload": {"observation_choices": ["gs"], "exposure_time": 300, "exposure_counts": 1, "priority": "1"}
    });
    let (status, body) = app
        .json("POST", "/api/followup_request", Some("owner-token"), Some(followup))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("kped"));

    let (status, _) = app.json("GET", "/api/followup_request/99", Some("owner-token"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_json_event_without_skymap() {
    let app = TestApp::new();
    let (status, body) = app
        .json(
            "POST",
            "/api/gcn_event",
            Some("owner-token"),
            Some(json!({"dateobs": "2020-02-02T02:02:02", "tags": ["Test"], "properties": {"FAR": 1e-7}})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Event stored without localization");

    let (_, list) = app
        .json(
            "GET",
            "/api/gcn_event?gcnPropertiesFilter=FAR:1e-6:lt",
            Some("owner-token"),
            None,
        )
        .await;
    assert_eq!(list["total"], 1);
}
