//! Integration tests for the worker health endpoint and general HTTP behaviour.

mod common;

use axum::http::StatusCode;
use common::{body_json, get, TestWorker};

#[tokio::test]
async fn ready_worker_reports_ok() {
    let worker = TestWorker::ready().await;
    let response = get(worker.app(), "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ready");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn booting_worker_is_unavailable() {
    let worker = TestWorker::new();
    let response = get(worker.app(), "/health").await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "booting");
}

#[tokio::test]
async fn retired_worker_is_unavailable() {
    let worker = TestWorker::ready().await;
    worker.worker.supervisor().retire("test");

    let response = get(worker.app(), "/health").await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "retired");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let worker = TestWorker::ready().await;
    let response = get(worker.app(), "/this-route-does-not-exist").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn response_contains_x_request_id_header() {
    let worker = TestWorker::ready().await;
    let response = get(worker.app(), "/health").await;

    let request_id = response
        .headers()
        .get("x-request-id")
        .expect("Response must contain an x-request-id header");
    // A UUID string, 36 chars with hyphens.
    assert_eq!(request_id.to_str().unwrap().len(), 36);
}
