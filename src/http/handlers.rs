//! HTTP handlers.

use super::AppState;
use crate::error::EngineError;
use crate::schedule_store::{Schedule, ScheduleCreate};
use axum::body::Body;
use axum::extract::{OriginalUri, Path, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

fn query_map(raw: Option<&str>) -> HashMap<String, String> {
    let Some(raw) = raw else { return HashMap::new() };
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.facade.health().await;
    let status = if report.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    let body = json!({
        "status": if report.healthy { "healthy" } else { "degraded" },
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "browser": {
            "healthy": report.healthy,
            "reason": report.reason,
            "lastSuccessfulRequest": report.last_successful_request.map(|_| state.start_time.elapsed().as_secs()),
            "timeSinceSuccess": report.time_since_success.map(|d| d.as_secs()),
            "consecutiveFailures": report.consecutive_failures,
            "totalRecoveries": report.total_recoveries,
            "recovering": report.recovering,
        }
    });

    (status, Json(body))
}

pub async fn favicon() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

/// Minimal stand-in for a full web configuration UI, which lives outside
/// this engine.
pub async fn ui_index() -> impl IntoResponse {
    axum::response::Html(
        "<html><body><h1>HA e-ink screenshot engine</h1><p>UI is an external collaborator; \
         see /api/schedules and /health.</p></body></html>",
    )
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

pub async fn list_schedules(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list().await {
        Ok(schedules) => Json(schedules).into_response(),
        Err(err) => engine_error_response(&err),
    }
}

pub async fn create_schedule(State(state): State<Arc<AppState>>, body: axum::body::Bytes) -> Response {
    let create: ScheduleCreate = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response(),
    };

    if <cron::Schedule as std::str::FromStr>::from_str(&crate::scheduler::normalize_cron(&create.cron)).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid cron expression: {}", create.cron) })),
        )
            .into_response();
    }

    match state.store.create(create).await {
        Ok(schedule) => (StatusCode::CREATED, Json(schedule)).into_response(),
        Err(err) => engine_error_response(&err),
    }
}

pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let patch: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response(),
    };

    match state.store.update(&id, patch).await {
        Ok(Some(schedule)) => Json(schedule).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => engine_error_response(&err),
    }
}

pub async fn delete_schedule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.delete(&id).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => engine_error_response(&err),
    }
}

/// `POST /api/schedules/{id}/send`. 404 when the schedule id is unknown,
/// 503 when the scheduler itself is unavailable, 500 otherwise.
pub async fn execute_schedule_now(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.scheduler.execute_now(&id).await {
        Ok(path) => Json(json!({ "status": "ok", "path": path.to_string_lossy() })).into_response(),
        Err(EngineError::ScheduleNotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(EngineError::SchedulerUnavailable) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(err) => {
            warn!("manual execute for '{id}' failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response()
        }
    }
}

#[derive(Serialize)]
struct DevicePreset {
    id: &'static str,
    label: &'static str,
}

/// Device-preset catalog; contract-only stub, no presets shipped yet.
pub async fn list_devices() -> impl IntoResponse {
    Json(Vec::<DevicePreset>::new())
}

pub async fn list_presets() -> impl IntoResponse {
    Json(Vec::<DevicePreset>::new())
}

/// `GET /js/*`, `GET /css/*`. Path joining rejects traversal outside
/// `static_dir`; MIME by extension.
pub async fn static_asset(State(state): State<Arc<AppState>>, Path(path): Path<String>) -> Response {
    let requested = state.config.static_dir.join(&path);

    let Ok(static_root) = state.config.static_dir.canonicalize() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(resolved) = requested.canonicalize() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !resolved.starts_with(&static_root) {
        return StatusCode::FORBIDDEN.into_response();
    }

    match tokio::fs::read(&resolved).await {
        Ok(bytes) => {
            let mime = mime_for_extension(resolved.extension().and_then(|e| e.to_str()));
            ([(header::CONTENT_TYPE, mime)], bytes).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn mime_for_extension(ext: Option<&str>) -> &'static str {
    match ext {
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// Catch-all screenshot route. Any path not matched above with a
/// `viewport` query becomes a screenshot request routed through the
/// Serializer.
pub async fn screenshot(State(state): State<Arc<AppState>>, OriginalUri(uri): OriginalUri, RawQuery(raw): RawQuery) -> Response {
    let params = query_map(raw.as_deref());
    let page_path = uri.path().to_string();

    let request = match crate::request::parse(&page_path, &params) {
        Ok(req) => req,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.0 }))).into_response(),
    };

    match state.serializer.screenshot(&request).await {
        Ok(capture) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, capture.content_type)
            .body(Body::from(capture.image))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(EngineError::CannotOpenPage { status, path, .. }) => (
            StatusCode::NOT_FOUND,
            format!("Cannot open page: {path} ({status})"),
        )
            .into_response(),
        Err(err @ (EngineError::RecoveryFailed { .. } | EngineError::BrowserCrash(_) | EngineError::PageCorrupted(_))) => {
            warn!("screenshot request for '{page_path}' failed: {err}");
            (StatusCode::SERVICE_UNAVAILABLE, "browser recovery in progress, retry shortly").into_response()
        }
        Err(EngineError::ImagePipelineError(message)) => {
            warn!("image pipeline failed for '{page_path}': {message}");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
        Err(err) => {
            warn!("screenshot request for '{page_path}' failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn engine_error_response(err: &EngineError) -> Response {
    warn!("request failed: {err}");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response()
}
