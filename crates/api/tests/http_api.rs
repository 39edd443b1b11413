mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use signalhub_api::app::build_app;

fn app() -> Router {
    build_app(common::scored_services())
}

async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let res = app.oneshot(req.body(body).unwrap()).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    call(app, Method::GET, uri, None).await
}

#[tokio::test]
async fn health_is_ok() {
    let (status, _) = get(app(), "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn current_prediction_is_served_from_the_latest_run() {
    let (status, body) = get(app(), "/predictions/churn/C001").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity_key"], "C001");
    assert_eq!(body["model_type"], "churn");

    let (status, run) = get(app(), "/predictions/churn").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run.as_array().unwrap().len(), common::CUSTOMERS as usize);
}

#[tokio::test]
async fn prediction_errors_use_json_bodies() {
    let (status, body) = get(app(), "/predictions/upsell/C001").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_model_type");

    let (status, body) = get(app(), "/predictions/churn/C999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = get(app(), "/forecast/store-1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn history_rejects_inverted_ranges() {
    let (status, body) =
        get(app(), "/predictions/churn/C001/history?from=2026-02-01T00:00:00Z&to=2026-01-01T00:00:00Z").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_range");

    let (status, body) = get(app(), "/predictions/churn/C001/history").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn churn_overview_counts_the_current_run() {
    let (status, body) = get(app(), "/insights/churn?threshold=0.5&top=3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scored"], common::CUSTOMERS);
    assert!(body["top"].as_array().unwrap().len() <= 3);
    assert_eq!(body["observed_churn_rate"], 0.5);

    let (status, body) = get(app(), "/insights/churn?threshold=2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_threshold");
}

#[tokio::test]
async fn operator_report_lists_sources() {
    let (status, body) = get(app(), "/ops/sources").await;
    assert_eq!(status, StatusCode::OK);
    let sources = body["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["source_id"], "telco");
    assert_eq!(sources[0]["last_watermark"], common::CUSTOMERS);
    assert_eq!(sources[0]["blocked"], false);

    let (status, jobs) = get(app(), "/ops/sources/telco/jobs?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs[0]["status"], "succeeded");

    let (status, body) = get(app(), "/ops/sources/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_source");
}

#[tokio::test]
async fn reprocess_deduplicates_stored_versions() {
    let app = app();
    let (status, job) = call(
        app.clone(),
        Method::POST,
        "/ops/sources/telco/reprocess",
        Some(json!({ "from_watermark": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["reprocess"], true);
    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["stats"]["deduplicated"], common::CUSTOMERS);
    assert_eq!(job["stats"]["applied"], 0);

    let (status, body) = call(
        app,
        Method::POST,
        "/ops/sources/telco/reprocess",
        Some(json!({ "from_watermark": -1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_watermark");
}

#[tokio::test]
async fn resuming_a_healthy_source_conflicts() {
    let (status, body) = call(app(), Method::POST, "/ops/sources/telco/resume", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_blocked");
}

#[tokio::test]
async fn model_status_reports_the_ready_artifact() {
    let (status, body) = get(app(), "/ops/models/churn").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"]["status"], "ready");
    assert_eq!(body["artifacts"].as_array().unwrap().len(), 1);

    let (status, body) = get(app(), "/ops/quarantine?source=telco").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());

    let (status, body) = get(app(), "/ops/alerts").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}
