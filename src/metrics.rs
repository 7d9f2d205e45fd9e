//! Ambient observability.
//!
//! Counters/histograms for captures, failures, recoveries, and
//! navigation/capture duration, exported as Prometheus text at `/metrics`.
//! Typed handles are obtained once at startup and recorded into from call
//! sites rather than looked up by name on every call.

use metrics::{Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

pub struct EngineMetrics {
    handle: PrometheusHandle,
    pub captures_total: Counter,
    pub captures_failed_total: Counter,
    pub capture_duration_seconds: Histogram,
    pub navigation_duration_seconds: Histogram,
    pub recoveries_total: Counter,
    pub browser_restarts_total: Counter,
    pub webhook_retries_total: Counter,
    pub webhook_failures_total: Counter,
    pub active_requests: Gauge,
    pub scheduled_runs_total: Counter,
    pub scheduled_runs_failed_total: Counter,
}

impl EngineMetrics {
    /// Installs the process-wide Prometheus recorder (once) and obtains
    /// typed handles for every counter/histogram this engine emits. Safe
    /// to call more than once within a process (e.g. across test
    /// functions in one binary); later calls reuse the first recorder.
    pub fn install() -> Self {
        let handle = RECORDER
            .get_or_init(|| {
                PrometheusBuilder::new()
                    .install_recorder()
                    .expect("failed to install Prometheus recorder")
            })
            .clone();

        Self {
            handle,
            captures_total: metrics::counter!("ha_eink_captures_total"),
            captures_failed_total: metrics::counter!("ha_eink_captures_failed_total"),
            capture_duration_seconds: metrics::histogram!("ha_eink_capture_duration_seconds"),
            navigation_duration_seconds: metrics::histogram!("ha_eink_navigation_duration_seconds"),
            recoveries_total: metrics::counter!("ha_eink_recoveries_total"),
            browser_restarts_total: metrics::counter!("ha_eink_browser_restarts_total"),
            webhook_retries_total: metrics::counter!("ha_eink_webhook_retries_total"),
            webhook_failures_total: metrics::counter!("ha_eink_webhook_failures_total"),
            active_requests: metrics::gauge!("ha_eink_active_requests"),
            scheduled_runs_total: metrics::counter!("ha_eink_scheduled_runs_total"),
            scheduled_runs_failed_total: metrics::counter!("ha_eink_scheduled_runs_failed_total"),
        }
    }

    pub fn record_capture(&self, elapsed: Duration, success: bool) {
        if success {
            self.captures_total.increment(1);
        } else {
            self.captures_failed_total.increment(1);
        }
        self.capture_duration_seconds.record(elapsed.as_secs_f64());
    }

    pub fn record_navigation(&self, elapsed: Duration) {
        self.navigation_duration_seconds.record(elapsed.as_secs_f64());
    }

    pub fn record_recovery(&self) {
        self.recoveries_total.increment(1);
    }

    pub fn record_browser_restart(&self) {
        self.browser_restarts_total.increment(1);
    }

    pub fn record_webhook_retry(&self) {
        self.webhook_retries_total.increment(1);
    }

    pub fn record_webhook_failure(&self) {
        self.webhook_failures_total.increment(1);
    }

    pub fn record_scheduled_run(&self, success: bool) {
        self.scheduled_runs_total.increment(1);
        if !success {
            self.scheduled_runs_failed_total.increment(1);
        }
    }

    /// Renders the current snapshot in Prometheus text exposition format,
    /// for the `/metrics` handler (`http/handlers.rs`).
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
