//! Process-wide configuration.
//!
//! Everything that varies by deployment — the Home Assistant origin, the
//! long-lived access token, browser idle/restart thresholds — lives in one
//! `AppConfig` built once at startup and threaded through every component
//! that needs it. No module reaches into the environment on its own past
//! this point.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// CSS-pixel viewport used for navigation and capture.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn is_valid(&self) -> bool {
        self.width >= 1 && self.height >= 1
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 758,
            height: 1024,
        }
    }
}

/// Main configuration structure for the engine.
///
/// Controls the Home Assistant connection, browser lifecycle thresholds,
/// and the output directory used by the scheduler for persisted
/// screenshots.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Home Assistant long-lived access token. Required unless `mock_ha` is set.
    pub access_token: Option<String>,

    /// Home Assistant base URL (no trailing slash).
    pub home_assistant_url: String,

    /// When true, the browser is never destroyed by idle timeout or the
    /// proactive-cleanup screenshot counter.
    pub keep_browser_open: bool,

    /// Idle timeout before the browser subprocess is destroyed (default 60s).
    #[serde(with = "duration_millis")]
    pub browser_timeout: Duration,

    /// Number of successful captures before a proactive browser restart.
    /// 0 disables proactive restart.
    pub max_screenshots_before_restart: usize,

    /// When true, the Browser Driver bypasses real navigation and returns a
    /// synthetic placeholder image, so the rest of the pipeline is
    /// exercisable without a reachable Home Assistant instance.
    pub mock_ha: bool,

    /// Whether the process is running inside the official HA add-on
    /// ("hosted"). Affects cold-start wait budgets (§4.1).
    pub is_hosted: bool,

    /// Directory that persisted scheduled screenshots are written under.
    pub output_dir: std::path::PathBuf,

    /// Directory static `/js` and `/css` assets are served from.
    pub static_dir: std::path::PathBuf,

    /// Path to the JSON file backing the default schedule store.
    pub schedule_store_path: std::path::PathBuf,

    /// HTTP listening port. Fixed at 10000 by default, overridable for
    /// local testing.
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            home_assistant_url: "http://homeassistant.local:8123".to_string(),
            keep_browser_open: false,
            browser_timeout: Duration::from_millis(60_000),
            max_screenshots_before_restart: 100,
            mock_ha: false,
            is_hosted: false,
            output_dir: std::path::PathBuf::from("./screenshots"),
            static_dir: std::path::PathBuf::from("./static"),
            schedule_store_path: std::path::PathBuf::from("./schedules.json"),
            port: 10_000,
        }
    }
}

impl AppConfig {
    /// Merge environment variable overrides onto a loaded/default config.
    /// Later overrides win; unset variables leave the existing value alone.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var("BROWSER_TIMEOUT") {
            if let Ok(ms) = raw.parse::<u64>() {
                self.browser_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(raw) = std::env::var("MAX_SCREENSHOTS_BEFORE_RESTART") {
            if let Ok(n) = raw.parse::<usize>() {
                self.max_screenshots_before_restart = n;
            }
        }
        if let Ok(raw) = std::env::var("MOCK_HA") {
            self.mock_ha = matches!(raw.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Ok(raw) = std::env::var("PORT") {
            if let Ok(p) = raw.parse::<u16>() {
                self.port = p;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), crate::error::EngineError> {
        if self.access_token.is_none() && !self.mock_ha {
            return Err(crate::error::EngineError::ConfigurationError(
                "access_token is required unless mock_ha is enabled".to_string(),
            ));
        }
        if self.browser_timeout.is_zero() {
            return Err(crate::error::EngineError::ConfigurationError(
                "browser_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Fixed tuning constants, named rather than inlined so each one's purpose
/// is traceable from its call site.
pub mod constants {
    use std::time::Duration;

    /// HA header height compensated for during navigation.
    pub const HEADER_HEIGHT: u32 = 56;
    pub const DEFAULT_WAIT_TIME_MS: u64 = 2000;
    pub const COLD_START_EXTRA_WAIT_MS: u64 = 5000;
    pub const SMART_WAIT_POLL_MS: u64 = 100;
    pub const SMART_WAIT_MIN_BOUND_MS: u64 = 3000;
    pub const HA_LOADING_POLL_MS: u64 = 100;
    pub const HA_LOADING_CAP_MS: u64 = 10_000;

    pub const MAX_FAILURES: u32 = 3;
    pub const STALE: Duration = Duration::from_secs(5 * 60);
    pub const MAX_RECOVERY_ATTEMPTS: u32 = 5;
    pub const RECOVERY_BACKOFF_BASE_MS: u64 = 1000;
    pub const RECOVERY_BACKOFF_CAP_MS: u64 = 30_000;
    pub const LIVENESS_PROBE_TIMEOUT_MS: u64 = 2000;

    pub const MAX_NEXT_REQUESTS: usize = 100;

    pub const SCHEDULER_RELOAD_INTERVAL_MS: u64 = 60_000;
    pub const RETENTION_MULTIPLIER: usize = 2;
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_DELAY_MS: u64 = 5000;

    pub const SHUTDOWN_GRACE_MS: u64 = 30_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_viewport_is_valid() {
        assert!(Viewport::default().is_valid());
    }

    #[test]
    fn zero_viewport_is_invalid() {
        assert!(!Viewport { width: 0, height: 480 }.is_valid());
    }

    #[test]
    fn validate_requires_token_without_mock_ha() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_allows_missing_token_in_mock_mode() {
        let config = AppConfig {
            mock_ha: true,
            ..AppConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("BROWSER_TIMEOUT", "12345");
        std::env::set_var("MAX_SCREENSHOTS_BEFORE_RESTART", "7");
        std::env::set_var("MOCK_HA", "true");
        let config = AppConfig::default().apply_env_overrides();
        assert_eq!(config.browser_timeout, Duration::from_millis(12345));
        assert_eq!(config.max_screenshots_before_restart, 7);
        assert!(config.mock_ha);
        std::env::remove_var("BROWSER_TIMEOUT");
        std::env::remove_var("MAX_SCREENSHOTS_BEFORE_RESTART");
        std::env::remove_var("MOCK_HA");
    }
}
