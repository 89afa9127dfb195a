//! Follow-up dispatch against in-process fake schedulers.

#![cfg(feature = "http-server")]

use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode},
    routing::{delete, post, put},
    Json, Router,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::{json, Value};

use skyportal_rust::api::{status, FacilityKind, Principal, TargetObject, UserId};
use skyportal_rust::db::{FollowupRepository, FullRepository, LocalRepository};
use skyportal_rust::facility::kped::{KpedApi, KpedClaims};
use skyportal_rust::facility::json_queue::JsonQueueApi;
use skyportal_rust::facility::{Facility, FacilityError, FacilityRegistry, TunnelPool};
use skyportal_rust::services::{DeleteOutcome, FollowupError, FollowupService, FollowupSubmission};

const SECRET: &str = "kped-secret";

#[derive(Debug, Clone)]
struct Received {
    method: String,
    path: String,
    authorization: Option<String>,
    body: String,
}

/// Answers every call with the configured status and records what it got.
#[derive(Clone)]
struct FakeScheduler {
    reply: Arc<Mutex<(u16, String)>>,
    received: Arc<Mutex<Vec<Received>>>,
}

impl FakeScheduler {
    fn new(status: u16, body: &str) -> Self {
        Self {
            reply: Arc::new(Mutex::new((status, body.to_string()))),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn set_reply(&self, status: u16, body: &str) {
        *self.reply.lock().unwrap() = (status, body.to_string());
    }

    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    fn answer(&self, method: Method, path: String, headers: &HeaderMap, body: String) -> (StatusCode, String) {
        self.received.lock().unwrap().push(Received {
            method: method.to_string(),
            path,
            authorization: headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            body,
        });
        let (code, body) = self.reply.lock().unwrap().clone();
        (StatusCode::from_u16(code).unwrap(), body)
    }
}

async fn queues(
    State(fake): State<FakeScheduler>,
    method: Method,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    fake.answer(method, "/api/queues".into(), &headers, body)
}

async fn requests(
    State(fake): State<FakeScheduler>,
    method: Method,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    fake.answer(method, "/requests".into(), &headers, body)
}

async fn request_by_id(
    State(fake): State<FakeScheduler>,
    Path(id): Path<i64>,
    method: Method,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    fake.answer(method, format!("/requests/{id}"), &headers, body)
}

async fn spawn_scheduler(fake: FakeScheduler) -> String {
    let app = Router::new()
        .route("/api/queues", put(queues).delete(queues))
        .route("/requests", post(requests))
        .route("/requests/{id}", delete(request_by_id))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn service(registry: FacilityRegistry) -> (Arc<LocalRepository>, FollowupService) {
    let repo = Arc::new(LocalRepository::new());
    let service = FollowupService::new(repo.clone() as Arc<dyn FullRepository>, Arc::new(registry));
    (repo, service)
}

fn kped_registry(base_url: &str) -> FacilityRegistry {
    let mut registry = FacilityRegistry::new();
    registry.register(Facility::Kped(
        KpedApi::new(base_url, SECRET, 5, TunnelPool::direct()).unwrap(),
    ));
    registry
}

fn observer() -> Principal {
    Principal {
        id: UserId(7),
        username: "observer".into(),
        is_admin: false,
    }
}

fn kped_submission() -> FollowupSubmission {
    FollowupSubmission {
        obj: TargetObject {
            id: "ZTF19aarzaod".into(),
            ra: 197.45,
            dec: -23.38,
        },
        allocation_id: Some(1),
        facility: FacilityKind::Kped,
        payload: json!({
            "observation_choices": ["gs", "rs", "ij"],
            "exposure_time": 300,
            "exposure_counts": 1,
            "priority": "3",
        }),
    }
}

fn decode_claims(token: &str) -> KpedClaims {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    jsonwebtoken::decode::<KpedClaims>(token, &DecodingKey::from_secret(SECRET.as_bytes()), &validation)
        .unwrap()
        .claims
}

#[tokio::test]
async fn test_kped_submit_created() {
    let fake = FakeScheduler::new(201, "queued");
    let base = spawn_scheduler(fake.clone()).await;
    let (_repo, service) = service(kped_registry(&base));

    let detail = service.create(kped_submission(), &observer()).await.unwrap();
    assert_eq!(detail.request.status, status::SUBMITTED);
    assert_eq!(detail.transactions.len(), 1);

    let received = fake.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].method, "PUT");
    assert_eq!(received[0].path, "/api/queues");

    let claims = decode_claims(&received[0].body);
    assert_eq!(claims.user, "observer");
    assert_eq!(claims.targets.len(), 3);
    assert!(claims.targets.iter().all(|t| t.id == detail.request.id.value()));
    assert_eq!(claims.targets[2].filter, "ij");
    assert_eq!(claims.targets[0].program_pi, "Kulkarni/observer");

    let transaction = &detail.transactions[0];
    assert_eq!(transaction.request["method"], "PUT");
    assert_eq!(transaction.response["status"], 201);
    assert_eq!(transaction.response["body"], "queued");
}

#[tokio::test]
async fn test_kped_non_created_is_rejected_not_error() {
    // 200 is not enough: the queue only confirms with 201.
    let fake = FakeScheduler::new(200, "duplicate target");
    let base = spawn_scheduler(fake.clone()).await;
    let (_repo, service) = service(kped_registry(&base));

    let detail = service.create(kped_submission(), &observer()).await.unwrap();
    assert_eq!(detail.request.status, "rejected: duplicate target");
    assert!(status::is_rejected(&detail.request.status));
    assert_eq!(detail.transactions.len(), 1);
}

#[tokio::test]
async fn test_kped_delete_after_submit() {
    let fake = FakeScheduler::new(201, "queued");
    let base = spawn_scheduler(fake.clone()).await;
    let (_repo, service) = service(kped_registry(&base));

    let detail = service.create(kped_submission(), &observer()).await.unwrap();
    fake.set_reply(200, "removed");

    let outcome = service.delete(detail.request.id, &observer()).await.unwrap();
    let DeleteOutcome::Dispatched(after) = outcome else {
        panic!("expected a dispatched delete");
    };
    assert_eq!(after.request.status, status::DELETED);
    assert_eq!(after.transactions.len(), 2);
    assert_eq!(fake.received()[1].method, "DELETE");
}

#[tokio::test]
async fn test_delete_by_other_user_is_forbidden() {
    let fake = FakeScheduler::new(201, "queued");
    let base = spawn_scheduler(fake.clone()).await;
    let (_repo, service) = service(kped_registry(&base));

    let detail = service.create(kped_submission(), &observer()).await.unwrap();
    let stranger = Principal {
        id: UserId(8),
        username: "stranger".into(),
        is_admin: false,
    };
    let err = service.delete(detail.request.id, &stranger).await.unwrap_err();
    assert!(matches!(err, FollowupError::Forbidden(_)));
    assert_eq!(fake.received().len(), 1);
}

#[tokio::test]
async fn test_unreachable_facility_keeps_status() {
    // Nothing listens on the discard port.
    let (repo, service) = service(kped_registry("http://127.0.0.1:9"));

    let err = service.create(kped_submission(), &observer()).await.unwrap_err();
    assert!(matches!(err, FollowupError::Facility(FacilityError::Transport(_))));

    let stored = repo
        .get_followup_request(skyportal_rust::api::FollowupRequestId(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, status::PENDING);
    assert!(repo.list_transactions(stored.id).await.unwrap().is_empty());

    // Never reached the facility, so it is removed locally.
    let outcome = service.delete(stored.id, &observer()).await.unwrap();
    assert_eq!(outcome, DeleteOutcome::RemovedLocally);
    assert!(repo.get_followup_request(stored.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_payload_is_refused_before_storing() {
    let (repo, service) = service(kped_registry("http://127.0.0.1:9"));
    let mut submission = kped_submission();
    submission.payload["observation_choices"] = json!(["zz"]);

    let err = service.create(submission, &observer()).await.unwrap_err();
    assert!(matches!(err, FollowupError::Facility(FacilityError::InvalidPayload(_))));
    assert!(repo
        .get_followup_request(skyportal_rust::api::FollowupRequestId(1))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unconfigured_facility() {
    let (_repo, service) = service(FacilityRegistry::new());
    let err = service.create(kped_submission(), &observer()).await.unwrap_err();
    assert!(matches!(
        err,
        FollowupError::Facility(FacilityError::NotConfigured(FacilityKind::Kped))
    ));
}

#[tokio::test]
async fn test_json_queue_round_trip_masks_token() {
    let fake = FakeScheduler::new(202, r#"{"accepted": true}"#);
    let base = spawn_scheduler(fake.clone()).await;
    let mut registry = FacilityRegistry::new();
    registry.register(Facility::JsonQueue(
        JsonQueueApi::new(base, Some("queue-token".into()), 5).unwrap(),
    ));
    let (_repo, service) = service(registry);

    let submission = FollowupSubmission {
        facility: FacilityKind::JsonQueue,
        payload: json!({"exposure_time": 60}),
        ..kped_submission()
    };
    let detail = service.create(submission, &observer()).await.unwrap();
    assert_eq!(detail.request.status, status::SUBMITTED);

    let received = fake.received();
    assert_eq!(received[0].path, "/requests");
    assert_eq!(received[0].authorization.as_deref(), Some("Bearer queue-token"));
    let document: Value = serde_json::from_str(&received[0].body).unwrap();
    assert_eq!(document["obj"]["id"], "ZTF19aarzaod");
    assert_eq!(document["requester"], "observer");
    assert_eq!(document["payload"]["exposure_time"], 60);

    let recorded = &detail.transactions[0].request;
    assert_eq!(recorded["headers"]["authorization"], "********");

    fake.set_reply(404, "unknown request");
    let outcome = service.delete(detail.request.id, &observer()).await.unwrap();
    let DeleteOutcome::Dispatched(after) = outcome else {
        panic!("expected a dispatched delete");
    };
    assert_eq!(after.request.status, "rejected: unknown request");
    assert_eq!(fake.received()[1].path, format!("/requests/{}", detail.request.id));
}

#[tokio::test]
async fn test_json_queue_requires_object_payload() {
    let mut registry = FacilityRegistry::new();
    registry.register(Facility::JsonQueue(
        JsonQueueApi::new("http://127.0.0.1:9", None, 5).unwrap(),
    ));
    let (_repo, service) = service(registry);

    let submission = FollowupSubmission {
        facility: FacilityKind::JsonQueue,
        payload: json!([1, 2, 3]),
        ..kped_submission()
    };
    let err = service.create(submission, &observer()).await.unwrap_err();
    assert!(matches!(err, FollowupError::Facility(FacilityError::InvalidPayload(_))));
}
