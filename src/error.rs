//! Crate-wide error type.
//!
//! Every distinguishable failure mode gets its own variant rather than a
//! string to match on later (the manual-execute endpoint in particular
//! matches on the enum, not on error text, to choose its status code).
//! HTTP handlers map variants to status codes at the router boundary;
//! everywhere else propagates with `?`.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Parameter Parser rejected the request. Maps to HTTP 400.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Navigation returned non-OK HTTP, DNS/network failure, or an explicit
    /// goto error. Maps to HTTP 404.
    #[error("Cannot open page: {path} ({status})")]
    CannotOpenPage {
        status: u16,
        path: String,
        network_error: Option<String>,
    },

    /// Subprocess launch failure, subprocess death, or a crash-indicative
    /// message ("Target closed", "Session closed", "Protocol error").
    #[error("browser crashed: {0}")]
    BrowserCrash(String),

    /// `pageErrorDetected` was set during the operation.
    #[error("page corrupted: {0}")]
    PageCorrupted(String),

    /// Pre-operation health evaluation returned unhealthy.
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    /// Recovery exhausted its attempt budget.
    #[error("recovery failed after {attempts} attempts: {last_error}")]
    RecoveryFailed { attempts: u32, last_error: String },

    /// The image pipeline's external tool failed or produced empty output.
    #[error("image pipeline error: {0}")]
    ImagePipelineError(String),

    /// Webhook delivery failed with a recognized network-error message.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Persisting the screenshot file failed; fatal to the cron run.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Malformed or inapplicable cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Schedule id not present in the store.
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// The scheduler has not been started / is unavailable.
    #[error("scheduler unavailable")]
    SchedulerUnavailable,

    /// Two callers attempted to use the driver concurrently without going
    /// through the serializer.
    #[error("browser is busy")]
    BrowserBusy,

    /// Timed out waiting on a bounded operation (liveness probe, HA-load wait).
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl EngineError {
    /// Whether this error, observed by the Facade, should count toward
    /// `consecutiveFailures`.
    pub fn counts_as_browser_failure(&self) -> bool {
        matches!(
            self,
            EngineError::BrowserCrash(_) | EngineError::PageCorrupted(_)
        )
    }

    /// Whether this error unconditionally triggers recovery regardless of
    /// the failure counter threshold (BrowserCrash does; PageCorrupted only
    /// does once the threshold is reached).
    pub fn forces_recovery(&self) -> bool {
        matches!(self, EngineError::BrowserCrash(_))
    }

    /// Webhook retry eligibility: matched by message against the known
    /// network-error set.
    pub fn is_retryable_webhook_error(message: &str) -> bool {
        const NETWORK_ERRORS: &[&str] = &[
            "Network error",
            "ERR_NAME_NOT_RESOLVED",
            "ERR_CONNECTION_REFUSED",
            "ERR_INTERNET_DISCONNECTED",
        ];
        NETWORK_ERRORS.iter().any(|needle| message.contains(needle))
    }

    /// Classify a raw driver-subprocess error message into the known
    /// crash-indicative set.
    pub fn message_indicates_crash(message: &str) -> bool {
        const CRASH_MARKERS: &[&str] = &["Target closed", "Session closed", "Protocol error"];
        CRASH_MARKERS.iter().any(|needle| message.contains(needle))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_markers_detected() {
        assert!(EngineError::message_indicates_crash("Protocol error (Page.navigate)"));
        assert!(EngineError::message_indicates_crash("Target closed."));
        assert!(!EngineError::message_indicates_crash("some other failure"));
    }

    #[test]
    fn webhook_network_errors_detected() {
        assert!(EngineError::is_retryable_webhook_error(
            "connect ERR_CONNECTION_REFUSED 10.0.0.1:443"
        ));
        assert!(!EngineError::is_retryable_webhook_error("401 Unauthorized"));
    }

    #[test]
    fn browser_crash_forces_recovery_but_corruption_does_not() {
        assert!(EngineError::BrowserCrash("x".into()).forces_recovery());
        assert!(!EngineError::PageCorrupted("x".into()).forces_recovery());
        assert!(EngineError::PageCorrupted("x".into()).counts_as_browser_failure());
    }
}
