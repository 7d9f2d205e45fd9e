//! Browser Facade.
//!
//! Observes every browser operation, evaluates health, and orchestrates
//! bounded-attempt recovery with exponential backoff.

use crate::browser_driver::BrowserDriver;
use crate::config::constants;
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub reason: Option<String>,
    pub last_successful_request: Option<Instant>,
    pub time_since_success: Option<Duration>,
    pub consecutive_failures: u32,
    pub total_recoveries: u32,
    pub recovering: bool,
}

/// Process-wide singleton tracking driver health. `recovering` is a real
/// mutex, not a flag, so concurrent callers await the in-flight recovery
/// instead of racing to start their own.
pub struct BrowserFacade {
    driver: Arc<BrowserDriver>,
    metrics: Option<Arc<EngineMetrics>>,
    last_success: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
    total_recoveries: AtomicU32,
    recovering: Mutex<()>,
    recovering_flag: AtomicBool,
}

impl BrowserFacade {
    pub fn new(driver: Arc<BrowserDriver>) -> Self {
        Self {
            driver,
            metrics: None,
            last_success: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            total_recoveries: AtomicU32::new(0),
            recovering: Mutex::new(()),
            recovering_flag: AtomicBool::new(false),
        }
    }

    /// Attaches the process-wide metrics handles. Separate from `new` so
    /// unit tests can construct a facade without installing a Prometheus
    /// recorder.
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_success.lock().await = Some(Instant::now());
    }

    /// Returns true once `consecutiveFailures` reaches `MAX_FAILURES`.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        failures >= constants::MAX_FAILURES
    }

    pub async fn health(&self) -> HealthReport {
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        let last_success = *self.last_success.lock().await;
        let time_since_success = last_success.map(|t| t.elapsed());

        let (healthy, reason) = if failures >= constants::MAX_FAILURES {
            (false, Some(format!("{failures} consecutive failures")))
        } else if time_since_success.is_some_and(|d| d > constants::STALE) && failures > 0 {
            (false, Some("stale: no successful request recently".to_string()))
        } else {
            (true, None)
        };

        HealthReport {
            healthy,
            reason,
            last_successful_request: last_success,
            time_since_success,
            consecutive_failures: failures,
            total_recoveries: self.total_recoveries.load(Ordering::SeqCst),
            recovering: self.recovering_flag.load(Ordering::SeqCst),
        }
    }

    /// Guarded so concurrent callers await the single in-flight recovery
    /// rather than racing.
    pub async fn recover(&self) -> Result<(), EngineError> {
        let _permit = self.recovering.lock().await;
        self.recovering_flag.store(true, Ordering::SeqCst);

        let result = self.run_recovery_attempts().await;

        self.recovering_flag.store(false, Ordering::SeqCst);
        result
    }

    async fn run_recovery_attempts(&self) -> Result<(), EngineError> {
        let mut last_error = String::new();

        for attempt in 1..=constants::MAX_RECOVERY_ATTEMPTS {
            self.driver.destroy().await;

            if attempt >= 2 {
                let backoff_ms =
                    (constants::RECOVERY_BACKOFF_BASE_MS * 2u64.pow(attempt - 1)).min(constants::RECOVERY_BACKOFF_CAP_MS);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }

            match self.probe_after_relaunch().await {
                Ok(()) => {
                    self.total_recoveries.fetch_add(1, Ordering::SeqCst);
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_recovery();
                    }
                    info!("browser recovery succeeded on attempt {attempt}");
                    return Ok(());
                }
                Err(err) => {
                    warn!("browser recovery attempt {attempt} failed: {err}");
                    last_error = err.to_string();
                }
            }
        }

        error!("browser recovery exhausted {} attempts", constants::MAX_RECOVERY_ATTEMPTS);
        Err(EngineError::RecoveryFailed {
            attempts: constants::MAX_RECOVERY_ATTEMPTS,
            last_error,
        })
    }

    async fn probe_after_relaunch(&self) -> Result<(), String> {
        let probe = crate::request::parse(
            "/",
            &[("viewport".to_string(), "1x1".to_string())].into_iter().collect(),
        )
        .map_err(|err| err.0)?;

        self.driver.navigate(&probe).await.map_err(|err| err.to_string())?;

        if tokio::time::timeout(Duration::from_millis(constants::LIVENESS_PROBE_TIMEOUT_MS), self.liveness())
            .await
            .unwrap_or(false)
        {
            Ok(())
        } else {
            Err("liveness probe failed after relaunch".to_string())
        }
    }

    async fn liveness(&self) -> bool {
        self.driver.liveness_probe().await
    }
}
