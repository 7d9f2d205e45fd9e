//! Request Serializer.
//!
//! Enforces a strict single-operation-in-flight contract over the Browser
//! Driver while shedding idle resources. A single resource is guarded by
//! one mutex — tokio's `Mutex` is itself a fair FIFO queue, so admission
//! order is preserved without a hand-rolled waiter list.

use crate::browser_driver::BrowserDriver;
use crate::config::{constants, AppConfig};
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::request::ScreenshotRequest;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::facade::BrowserFacade;

pub struct CaptureResult {
    pub image: Vec<u8>,
    pub content_type: &'static str,
}

/// Owns the FIFO admission gate, the idle/proactive cleanup bookkeeping,
/// and the bounded next-request preload queue.
pub struct RequestSerializer {
    config: Arc<AppConfig>,
    driver: Arc<BrowserDriver>,
    facade: Arc<BrowserFacade>,
    metrics: Option<Arc<EngineMetrics>>,
    op_lock: Mutex<()>,
    last_access: Mutex<Instant>,
    screenshots_since_restart: AtomicUsize,
    pending_preloads: Mutex<VecDeque<JoinHandle<()>>>,
    cleanup_generation: AtomicUsize,
}

impl RequestSerializer {
    pub fn new(config: Arc<AppConfig>, driver: Arc<BrowserDriver>, facade: Arc<BrowserFacade>) -> Arc<Self> {
        Arc::new(Self {
            config,
            driver,
            facade,
            metrics: None,
            op_lock: Mutex::new(()),
            last_access: Mutex::new(Instant::now()),
            screenshots_since_restart: AtomicUsize::new(0),
            pending_preloads: Mutex::new(VecDeque::new()),
            cleanup_generation: AtomicUsize::new(0),
        })
    }

    /// Attaches the process-wide metrics handles. Kept out of `new` so
    /// mock-mode unit tests don't need a Prometheus recorder installed.
    pub fn with_metrics(self: Arc<Self>, metrics: Arc<EngineMetrics>) -> Arc<Self> {
        Arc::new(Self {
            config: self.config.clone(),
            driver: self.driver.clone(),
            facade: self.facade.clone(),
            metrics: Some(metrics),
            op_lock: Mutex::new(()),
            last_access: Mutex::new(Instant::now()),
            screenshots_since_restart: AtomicUsize::new(0),
            pending_preloads: Mutex::new(VecDeque::new()),
            cleanup_generation: AtomicUsize::new(0),
        })
    }

    /// Admits one operation at a time, runs it, and records metrics/idle
    /// bookkeeping around it. Parameter parsing happens in the HTTP layer
    /// before this is called, since it needs no admission to the queue.
    pub async fn screenshot(self: &Arc<Self>, req: &ScreenshotRequest) -> Result<CaptureResult, EngineError> {
        let _admission = self.op_lock.lock().await;
        *self.last_access.lock().await = Instant::now();

        let start = Instant::now();
        let result = self.run_operation(req).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_capture(start.elapsed(), result.is_ok());
        }
        if result.is_ok() {
            self.after_success(req).await;
        }
        self.arm_idle_cleanup();

        result
    }

    async fn run_operation(self: &Arc<Self>, req: &ScreenshotRequest) -> Result<CaptureResult, EngineError> {
        if !self.facade.health().await.healthy {
            self.facade.recover().await?;
        }

        let nav_start = Instant::now();
        if let Err(err) = self.driver.navigate(req).await {
            if matches!(err, EngineError::CannotOpenPage { .. }) {
                return Err(err);
            }
            self.handle_failure_and_maybe_recover(&err).await?;
            self.driver.navigate(req).await?;
        }
        let navigation_elapsed = nav_start.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_navigation(navigation_elapsed);
        }

        let capture = match self.driver.capture(req).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.handle_failure_and_maybe_recover(&err).await?;
                self.driver.capture(req).await?
            }
        };

        self.facade.record_success().await;
        self.schedule_next_request_preload(req, navigation_elapsed + capture.elapsed).await;

        Ok(CaptureResult {
            image: capture.image,
            content_type: req.format.content_type(),
        })
    }

    /// Records the failure, and if the error forces recovery outright or
    /// pushes the counter past the threshold, runs recovery. Propagates
    /// `RecoveryFailed` if recovery itself is exhausted.
    async fn handle_failure_and_maybe_recover(&self, err: &EngineError) -> Result<(), EngineError> {
        if !err.counts_as_browser_failure() {
            return Err(err.clone());
        }
        let threshold_reached = self.facade.record_failure();
        if err.forces_recovery() || threshold_reached {
            self.facade.recover().await?;
        }
        Ok(())
    }

    async fn after_success(&self, req: &ScreenshotRequest) {
        let count = self.screenshots_since_restart.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.max_screenshots_before_restart > 0 && count >= self.config.max_screenshots_before_restart {
            info!("proactive cleanup: {count} captures since last restart, destroying browser");
            self.driver.destroy().await;
            self.screenshots_since_restart.store(0, Ordering::SeqCst);
            if let Some(metrics) = &self.metrics {
                metrics.record_browser_restart();
            }
        }
        let _ = req;
    }

    /// Speculatively navigates ahead of a caller-declared next request
    /// (`req.next`, seconds until the next expected call), so that request's
    /// navigation cost is already paid when it actually arrives.
    async fn schedule_next_request_preload(self: &Arc<Self>, req: &ScreenshotRequest, elapsed: Duration) {
        let Some(next_seconds) = req.next else { return };
        let delay_ms = (next_seconds as i64) * 1000 - elapsed.as_millis() as i64 - 1000;
        if delay_ms <= 0 {
            return;
        }

        let driver = self.driver.clone();
        let mut preload_req = req.clone();
        preload_req.wait = Some(0);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            if let Err(err) = driver.navigate(&preload_req).await {
                warn!("next-request preload navigation failed: {err}");
            }
        });

        // Bound the pending preload queue; drop (abort) the oldest entry
        // when full rather than let it grow unbounded.
        let mut queue = self.pending_preloads.lock().await;
        queue.push_back(handle);
        while queue.len() > constants::MAX_NEXT_REQUESTS {
            if let Some(oldest) = queue.pop_front() {
                oldest.abort();
            }
        }
    }

    /// Each call supersedes any previously armed check by bumping a
    /// generation counter the spawned task compares against before acting.
    fn arm_idle_cleanup(self: &Arc<Self>) {
        if self.config.keep_browser_open {
            return;
        }
        let generation = self.cleanup_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        tokio::spawn(async move {
            let delay = Duration::from_millis(this.config.browser_timeout.as_millis() as u64 + 100);
            tokio::time::sleep(delay).await;
            this.run_idle_cleanup_check(generation).await;
        });
    }

    async fn run_idle_cleanup_check(self: Arc<Self>, generation: usize) {
        if self.cleanup_generation.load(Ordering::SeqCst) != generation {
            // Superseded by a more recent access; that access already
            // armed its own check.
            return;
        }
        if self.op_lock.try_lock().is_err() {
            // Busy: re-arm for later rather than destroying mid-operation.
            self.arm_idle_cleanup();
            return;
        }
        let idle_for = self.last_access.lock().await.elapsed();
        if idle_for >= self.config.browser_timeout {
            info!("idle timeout reached ({idle_for:?}), destroying browser");
            self.driver.destroy().await;
        }
    }

    pub async fn shutdown(&self) {
        let mut queue = self.pending_preloads.lock().await;
        for handle in queue.drain(..) {
            handle.abort();
        }
        self.driver.destroy().await;
    }
}
