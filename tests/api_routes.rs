//! HTTP surface tests driven through the router without a socket

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use knowledge_substrate::api::{build_router, AppState};
use knowledge_substrate::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> Router {
    let substrate = Substrate::new(Config::default()).unwrap();
    let schema = substrate.schema();
    let proposal = schema
        .propose_change(
            SchemaDiff::new()
                .add_entity_type(EntityTypeDef::new("Company"))
                .add_entity_type(EntityTypeDef::new("Person"))
                .upsert_predicate(PredicateDef::new(
                    "ceo",
                    "Company",
                    RangeSpec::Entity("Person".into()),
                )),
        )
        .unwrap();
    schema.approve(proposal).unwrap();
    build_router(AppState::new(Arc::new(substrate)))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["ontology_version"], 1);
}

#[tokio::test]
async fn test_ingest_and_audit_flow() {
    let app = app();
    for (kind, name) in [("Company", "CompanyX"), ("Person", "Alice")] {
        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/entities",
            Some(json!({ "entity_type": kind, "canonical_name": name })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, outcome) = send(
        &app,
        "POST",
        "/api/v1/ingest",
        Some(json!({
            "subject": "CompanyX",
            "predicate": "ceo",
            "object": { "entity": "Alice" },
            "source": "S1",
            "observedAt": "2020-01-01T00:00:00Z",
            "credibilityHint": 0.9
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "committed");

    let fact_id = outcome["fact"]["id"].as_str().unwrap().to_string();
    let subject = outcome["fact"]["subject"].as_str().unwrap().to_string();

    let (status, fact) = send(&app, "GET", &format!("/api/v1/facts/{}", fact_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fact["predicate"], "ceo");

    let (status, history) = send(
        &app,
        "GET",
        &format!("/api/v1/entities/{}/history/ceo", subject),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);

    let (status, as_of) = send(
        &app,
        "GET",
        &format!(
            "/api/v1/entities/{}/facts?predicate=ceo&as_of=2019-06-01T00:00:00Z",
            subject
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(as_of.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_schema_violation_maps_to_422() {
    let app = app();
    send(
        &app,
        "POST",
        "/api/v1/entities",
        Some(json!({ "entity_type": "Company", "canonical_name": "CompanyX" })),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/ingest",
        Some(json!({
            "subject": "CompanyX",
            "predicate": "marketCapUSD",
            "object": 1.5e12,
            "source": "filings",
            "observedAt": "2020-01-01T00:00:00Z"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "SCHEMA_VIOLATION");
}

#[tokio::test]
async fn test_unknown_fact_is_404() {
    let app = app();
    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/v1/facts/{}", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_schema_proposal_lifecycle() {
    let app = app();
    let (status, proposal) = send(
        &app,
        "POST",
        "/api/v1/schema/proposals",
        Some(json!({ "add_entity_types": [{ "name": "Fund" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = proposal["id"].as_str().unwrap().to_string();

    let (_, pending) = send(&app, "GET", "/api/v1/schema/proposals", None).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);

    let (status, version) = send(
        &app,
        "POST",
        &format!("/api/v1/schema/proposals/{}/approve", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(version["number"], 2);

    let (_, active) = send(&app, "GET", "/api/v1/schema", None).await;
    assert_eq!(active["number"], 2);
}

#[tokio::test]
async fn test_session_lifecycle() {
    let app = app();
    let (status, created) = send(&app, "POST", "/api/v1/sessions", Some(json!({ "capacity": 2 }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap().to_string();

    let node = json!({ "kind": "entity", "id": uuid::Uuid::new_v4() });
    let (status, outcomes) = send(
        &app,
        "POST",
        &format!("/api/v1/sessions/{}/stage", id),
        Some(json!({ "items": [{ "node": node, "activation": 0.6 }], "source_tag": "test" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcomes[0]["outcome"], "inserted");

    let (_, snapshot) = send(&app, "GET", &format!("/api/v1/sessions/{}/snapshot", id), None).await;
    assert_eq!(snapshot.as_array().unwrap().len(), 1);

    let (status, released) = send(
        &app,
        "POST",
        &format!("/api/v1/sessions/{}/release", id),
        Some(json!({ "node": node })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(released["phase"], "evicted");

    let (status, _) = send(&app, "DELETE", &format!("/api/v1/sessions/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, "GET", &format!("/api/v1/sessions/{}/snapshot", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_exported() {
    let app = app();
    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("facts_committed_total"));
}
