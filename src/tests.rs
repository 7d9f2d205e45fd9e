//! Cross-module integration tests.
//!
//! Each module's own `#[cfg(test)]` block covers its unit-level contract;
//! these drive the assembled HTTP router end to end in mock mode, the way a
//! real client would, to catch wiring mistakes the per-module tests can't see.

use crate::browser_driver::BrowserDriver;
use crate::config::AppConfig;
use crate::facade::BrowserFacade;
use crate::http::{build_router, AppState};
use crate::metrics::EngineMetrics;
use crate::schedule_executor::ScheduleExecutor;
use crate::schedule_store::{JsonFileScheduleStore, ScheduleStore};
use crate::scheduler::Scheduler;
use crate::serializer::RequestSerializer;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt;

async fn test_state(dir: &std::path::Path) -> Arc<AppState> {
    let config = Arc::new(AppConfig {
        mock_ha: true,
        output_dir: dir.join("screenshots"),
        schedule_store_path: dir.join("schedules.json"),
        ..AppConfig::default()
    });

    let driver = Arc::new(BrowserDriver::new(config.clone()));
    let facade = Arc::new(BrowserFacade::new(driver.clone()));
    let serializer = RequestSerializer::new(config.clone(), driver, facade.clone());
    let store: Arc<dyn ScheduleStore> = JsonFileScheduleStore::open(config.schedule_store_path.clone()).await.unwrap();
    let executor = Arc::new(ScheduleExecutor::new(config.clone(), serializer.clone()));
    let scheduler = Scheduler::new(config.clone(), store.clone(), executor).await.unwrap();

    Arc::new(AppState {
        config,
        serializer,
        facade,
        scheduler,
        store,
        metrics: Arc::new(EngineMetrics::install()),
        start_time: Instant::now(),
    })
}

#[tokio::test]
async fn health_endpoint_reports_healthy_with_no_prior_failures() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(test_state(dir.path()).await);

    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn screenshot_fallback_returns_png_in_mock_mode() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(test_state(dir.path()).await);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/lovelace/0?viewport=800x480")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(axum::http::header::CONTENT_TYPE).unwrap(),
        "image/png"
    );
}

#[tokio::test]
async fn screenshot_fallback_rejects_invalid_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(test_state(dir.path()).await);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/lovelace/0?viewport=not-a-size")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn schedule_crud_round_trips_through_http() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(test_state(dir.path()).await);

    let create_body = json!({
        "name": "Kitchen Dashboard",
        "cron": "*/5 * * * *",
        "dashboard_path": "/lovelace/kitchen",
    });

    let create_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/schedules")
                .header("content-type", "application/json")
                .body(Body::from(create_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::CREATED);

    let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX).await.unwrap();
    let created: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let list_response = router
        .clone()
        .oneshot(Request::builder().uri("/api/schedules").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(list_response.status(), StatusCode::OK);

    let delete_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/schedules/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(delete_response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_schedule_with_invalid_cron_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(test_state(dir.path()).await);

    let create_body = json!({
        "name": "Bad Cron",
        "cron": "not a cron expression",
        "dashboard_path": "/lovelace/0",
    });

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/schedules")
                .header("content-type", "application/json")
                .body(Body::from(create_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn execute_now_on_unknown_schedule_returns_404() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(test_state(dir.path()).await);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/schedules/does-not-exist/send")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(test_state(dir.path()).await);

    let response = router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
