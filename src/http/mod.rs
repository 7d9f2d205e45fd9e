//! HTTP Router.
//!
//! Dispatch by exact path and method, more-specific routes before the
//! generic screenshot fallback. Built on `axum`.

pub mod handlers;

use crate::config::AppConfig;
use crate::facade::BrowserFacade;
use crate::metrics::EngineMetrics;
use crate::scheduler::Scheduler;
use crate::schedule_store::ScheduleStore;
use crate::serializer::RequestSerializer;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub serializer: Arc<RequestSerializer>,
    pub facade: Arc<BrowserFacade>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn ScheduleStore>,
    pub metrics: Arc<EngineMetrics>,
    pub start_time: Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/favicon.ico", get(handlers::favicon))
        .route("/", get(handlers::ui_index))
        .route("/metrics", get(handlers::metrics))
        .route("/api/schedules", get(handlers::list_schedules).post(handlers::create_schedule))
        .route("/api/schedules/:id/send", post(handlers::execute_schedule_now))
        .route(
            "/api/schedules/:id",
            put(handlers::update_schedule).delete(handlers::delete_schedule),
        )
        .route("/api/devices", get(handlers::list_devices))
        .route("/api/presets", get(handlers::list_presets))
        .route("/js/*path", get(handlers::static_asset))
        .route("/css/*path", get(handlers::static_asset))
        .fallback(handlers::screenshot)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
