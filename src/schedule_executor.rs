//! Schedule Executor.
//!
//! Per-run command chain: build params, capture through the Serializer,
//! save to disk, prune retention, POST a webhook. The retry/backoff loop
//! here covers webhook network errors only — capture retries already live
//! in the Serializer.

use crate::config::{constants, AppConfig, Viewport};
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::request::{CropRegion, ImageFormat, Rotate, ScreenshotRequest};
use crate::schedule_store::Schedule;
use crate::serializer::RequestSerializer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ScheduleExecutor {
    config: Arc<AppConfig>,
    serializer: Arc<RequestSerializer>,
    metrics: Option<Arc<EngineMetrics>>,
    http_client: reqwest::Client,
}

impl ScheduleExecutor {
    pub fn new(config: Arc<AppConfig>, serializer: Arc<RequestSerializer>) -> Self {
        Self { config, serializer, metrics: None, http_client: reqwest::Client::new() }
    }

    /// Attaches the process-wide metrics handles.
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs the full chain for one schedule, ignoring `enabled` — both the
    /// cron callback and manual-execute route through here.
    pub async fn run(&self, schedule: &Schedule, enabled_schedule_count: usize) -> Result<PathBuf, EngineError> {
        let request = build_request(schedule);

        let capture = match self.serializer.screenshot(&request).await {
            Ok(capture) => capture,
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_scheduled_run(false);
                }
                return Err(err);
            }
        };

        let path = self.save_to_disk(schedule, &capture.image, request.format).await?;
        info!("schedule '{}' captured {} bytes -> {}", schedule.name, capture.image.len(), path.display());

        if let Err(err) = self.prune(enabled_schedule_count).await {
            warn!("retention prune failed for schedule '{}': {err}", schedule.name);
        }

        if let Some(webhook_url) = &schedule.webhook_url {
            if let Err(err) = self.deliver_webhook(webhook_url, &schedule.webhook_headers, &capture.image, request.format).await {
                warn!("webhook delivery failed for schedule '{}': {err}", schedule.name);
                if let Some(metrics) = &self.metrics {
                    metrics.record_webhook_failure();
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_scheduled_run(true);
        }
        Ok(path)
    }

    /// Filename shape: `{sanitized_name}_{ISO-timestamp}.{ext}`, with colons
    /// and dots in the timestamp hyphened so the filename is valid on every
    /// target filesystem.
    async fn save_to_disk(&self, schedule: &Schedule, image: &[u8], format: ImageFormat) -> Result<PathBuf, EngineError> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let sanitized = sanitize_name(&schedule.name);
        let timestamp = chrono::Utc::now().to_rfc3339().replace([':', '.'], "-");
        let filename = format!("{sanitized}_{timestamp}.{}", format.extension());
        let path = self.config.output_dir.join(filename);

        tokio::fs::write(&path, image).await.map_err(|err| EngineError::StorageError(err.to_string()))?;
        Ok(path)
    }

    /// Deletes oldest-first until the count is within
    /// `enabled_schedule_count * RETENTION_MULTIPLIER`.
    async fn prune(&self, enabled_schedule_count: usize) -> Result<(), EngineError> {
        let limit = enabled_schedule_count * constants::RETENTION_MULTIPLIER;

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.output_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_image = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("png" | "jpg" | "jpeg" | "bmp")
            );
            if !is_image {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            entries.push((path, modified));
        }

        entries.sort_by_key(|(_, modified)| *modified);

        if entries.len() <= limit {
            return Ok(());
        }
        let to_remove = entries.len() - limit;
        for (path, _) in entries.into_iter().take(to_remove) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!("failed to prune {:?}: {err}", path);
            }
        }
        Ok(())
    }

    /// Retries only network-error messages up to `MAX_RETRIES`, with a
    /// fixed delay between attempts.
    async fn deliver_webhook(
        &self,
        url: &str,
        custom_headers: &std::collections::HashMap<String, String>,
        image: &[u8],
        format: ImageFormat,
    ) -> Result<(), EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(url, custom_headers, image, format).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let message = err.to_string();
                    if attempt >= constants::MAX_RETRIES || !EngineError::is_retryable_webhook_error(&message) {
                        return Err(err);
                    }
                    warn!("webhook attempt {attempt} failed ({message}), retrying");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_webhook_retry();
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(constants::RETRY_DELAY_MS)).await;
                }
            }
        }
    }

    async fn post_once(
        &self,
        url: &str,
        custom_headers: &std::collections::HashMap<String, String>,
        image: &[u8],
        format: ImageFormat,
    ) -> Result<(), EngineError> {
        let mut request = self.http_client.post(url).body(image.to_vec());
        for (key, value) in custom_headers {
            if key.eq_ignore_ascii_case("content-type") {
                continue;
            }
            request = request.header(key, value);
        }
        // Content-Type is applied last so no custom header can override it.
        request = request.header(reqwest::header::CONTENT_TYPE, format.content_type());

        let response = request
            .send()
            .await
            .map_err(|err| EngineError::NetworkError(classify_reqwest_error(&err)))?;

        let status = response.status();
        let body_preview: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(500)
            .collect();

        if !status.is_success() {
            return Err(EngineError::NetworkError(format!(
                "webhook POST returned {status}: {body_preview}"
            )));
        }
        Ok(())
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> String {
    if err.is_connect() {
        "ERR_CONNECTION_REFUSED".to_string()
    } else if err.is_timeout() {
        "Network error: timeout".to_string()
    } else {
        format!("Network error: {err}")
    }
}

/// Defaults: dashboard `/lovelace/0`, viewport 758x1024, format png, zoom 1,
/// dark false; `crop`/`dithering` propagate only when their `enabled` flag
/// is true.
fn build_request(schedule: &Schedule) -> ScreenshotRequest {
    let viewport = schedule.viewport.unwrap_or_default();
    let format = schedule.format.as_deref().map(ImageFormat::parse).unwrap_or(ImageFormat::Png);
    let rotate = schedule.rotate.and_then(Rotate::from_degrees);
    let crop = schedule.crop.filter(|c| c.enabled).map(CropRegion::from);
    let dithering = schedule.dithering.as_ref().filter(|d| d.enabled).map(|d| d.options);

    ScreenshotRequest {
        page_path: if schedule.dashboard_path.is_empty() {
            "/lovelace/0".to_string()
        } else {
            schedule.dashboard_path.clone()
        },
        viewport,
        zoom: schedule.zoom.unwrap_or(1.0),
        crop,
        rotate,
        invert: schedule.invert.unwrap_or(false),
        format,
        wait: None,
        lang: schedule.lang.clone(),
        theme: schedule.theme.clone(),
        dark: schedule.dark.unwrap_or(false),
        dithering,
        next: None,
    }
}

/// Replaces each non-alphanumeric character with `_`.
fn sanitize_name(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DitheringOptions;
    use std::collections::HashMap;

    fn schedule() -> Schedule {
        Schedule {
            id: "s1".into(),
            name: "My Dashboard!".into(),
            enabled: true,
            cron: "* * * * *".into(),
            dashboard_path: String::new(),
            viewport: None,
            zoom: None,
            format: None,
            dark: None,
            lang: None,
            theme: None,
            invert: None,
            rotate: None,
            crop: None,
            dithering: None,
            webhook_url: None,
            webhook_headers: HashMap::new(),
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn sanitize_replaces_non_alphanumeric() {
        assert_eq!(sanitize_name("My Dashboard!"), "My_Dashboard_");
    }

    #[test]
    fn build_request_applies_documented_defaults() {
        let req = build_request(&schedule());
        assert_eq!(req.page_path, "/lovelace/0");
        assert_eq!(req.viewport, Viewport::default());
        assert_eq!(req.format, ImageFormat::Png);
        assert_eq!(req.zoom, 1.0);
        assert!(!req.dark);
        assert!(req.crop.is_none());
        assert!(req.dithering.is_none());
    }

    #[test]
    fn disabled_crop_and_dithering_do_not_propagate() {
        let mut s = schedule();
        s.crop = Some(crate::schedule_store::ScheduleCrop { enabled: false, x: 1, y: 1, width: 10, height: 10 });
        s.dithering = Some(crate::schedule_store::ScheduleDithering {
            enabled: false,
            options: DitheringOptions::default(),
        });
        let req = build_request(&s);
        assert!(req.crop.is_none());
        assert!(req.dithering.is_none());
    }

    #[test]
    fn enabled_crop_propagates() {
        let mut s = schedule();
        s.crop = Some(crate::schedule_store::ScheduleCrop { enabled: true, x: 1, y: 2, width: 10, height: 20 });
        let req = build_request(&s);
        assert_eq!(req.crop, Some(CropRegion { x: 1, y: 2, width: 10, height: 20 }));
    }
}
