//! Browser Driver.
//!
//! Owns a single headless-browser subprocess and presents a two-operation
//! contract, `navigate` then `capture`, over it. There is never more than
//! one instance in flight: callers that need to share the browser queue
//! through the Serializer rather than spinning up a second subprocess.

use crate::config::{constants, AppConfig};
use crate::error::EngineError;
use crate::image_pipeline::{self, ProcessOptions};
use crate::request::ScreenshotRequest;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, CaptureScreenshotParams, Viewport as ClipRegion,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

/// Cache of values applied to the current page, invalidated whenever the
/// subprocess is destroyed.
struct PageCache {
    last_path: Option<String>,
    last_lang: Option<String>,
    last_theme: Option<String>,
    last_dark: bool,
    first_navigation: bool,
}

impl Default for PageCache {
    fn default() -> Self {
        Self {
            last_path: None,
            last_lang: None,
            last_theme: None,
            last_dark: false,
            first_navigation: true,
        }
    }
}

struct BrowserState {
    browser: Browser,
    handler: tokio::task::JoinHandle<()>,
    page: Page,
    cache: PageCache,
    page_error: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
}

pub struct NavigateOutcome {
    pub elapsed: Duration,
}

pub struct CaptureOutcome {
    pub image: Vec<u8>,
    pub elapsed: Duration,
}

/// Owns the single browser subprocess. All mutating calls acquire `state`;
/// `in_flight` enforces the "no overlapping calls" concurrency contract
/// independently of whatever queue a caller (the Serializer) puts in front
/// of this driver.
pub struct BrowserDriver {
    config: Arc<AppConfig>,
    state: Mutex<Option<BrowserState>>,
    in_flight: AtomicBool,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> Drop for InFlightGuard<'a> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BrowserDriver {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            state: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    fn acquire_in_flight(&self) -> Result<InFlightGuard<'_>, EngineError> {
        if self.in_flight.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(EngineError::BrowserBusy);
        }
        Ok(InFlightGuard(&self.in_flight))
    }

    pub async fn is_present(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn navigate(&self, req: &ScreenshotRequest) -> Result<NavigateOutcome, EngineError> {
        if self.config.mock_ha {
            return Ok(NavigateOutcome { elapsed: Duration::from_millis(1) });
        }

        let _guard = self.acquire_in_flight()?;
        let start = Instant::now();

        let mut state_guard = self.state.lock().await;
        if state_guard.is_none() {
            *state_guard = Some(self.launch().await?);
        }
        let state = state_guard.as_mut().expect("launched above");

        let scaled_height = req.viewport.height + (constants::HEADER_HEIGHT as f64 * req.zoom) as u32;
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(req.viewport.width as i64)
            .height(scaled_height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|err| EngineError::BrowserCrash(err.to_string()))?;
        state.page.execute(metrics).await.map_err(|err| classify(&err.to_string()))?;

        let is_first = state.cache.first_navigation;
        let path_changed = state.cache.last_path.as_deref() != Some(req.page_path.as_str());

        let mut wait_budget_ms = if path_changed || is_first {
            let url = format!("{}{}", self.config.home_assistant_url, req.page_path);
            state
                .page
                .goto(&url)
                .await
                .map_err(|err| classify_navigation(&err.to_string(), &req.page_path))?;
            state.cache.last_path = Some(req.page_path.clone());

            if is_first {
                constants::DEFAULT_WAIT_TIME_MS
                    + if self.config.is_hosted { constants::COLD_START_EXTRA_WAIT_MS } else { 0 }
            } else {
                constants::DEFAULT_WAIT_TIME_MS
            }
        } else {
            dispatch_route_change(&state.page, &req.page_path).await?;
            constants::DEFAULT_WAIT_TIME_MS
        };
        state.cache.first_navigation = false;

        wait_for_ha_loading_to_clear(&state.page).await;

        if !is_first {
            let dismissed = dismiss_active_toast(&state.page).await;
            set_page_zoom(&state.page, req.zoom).await?;
            if dismissed {
                wait_budget_ms += 1000;
            }
        }

        if state.cache.last_lang.as_deref() != req.lang.as_deref() {
            if let Some(lang) = &req.lang {
                set_language(&state.page, lang).await?;
            }
            state.cache.last_lang = req.lang.clone();
            wait_budget_ms += 1000;
        }

        if state.cache.last_theme.as_deref() != req.theme.as_deref() || state.cache.last_dark != req.dark {
            dispatch_set_theme(&state.page, req.theme.as_deref(), req.dark).await?;
            state.cache.last_theme = req.theme.clone();
            state.cache.last_dark = req.dark;
            wait_budget_ms += 500;
        }

        // `wait=0` and absent both select smart-wait; only a positive value
        // requests a fixed sleep.
        match req.wait {
            Some(ms) if ms > 0 => {
                sleep(Duration::from_millis(ms)).await;
            }
            _ => {
                let bound = Duration::from_millis(wait_budget_ms.max(constants::SMART_WAIT_MIN_BOUND_MS));
                smart_wait(&state.page, bound).await;
            }
        }

        if state.page_error.load(Ordering::SeqCst) {
            return Err(EngineError::PageCorrupted("pageErrorDetected during navigate".into()));
        }

        Ok(NavigateOutcome { elapsed: start.elapsed() })
    }

    pub async fn capture(&self, req: &ScreenshotRequest) -> Result<CaptureOutcome, EngineError> {
        if let Some(crop) = req.crop {
            if !crop.fits_within(req.viewport) {
                return Err(EngineError::InvalidRequest(format!(
                    "crop {}x{}+{}+{} exceeds viewport {}x{}",
                    crop.width, crop.height, crop.x, crop.y, req.viewport.width, req.viewport.height
                )));
            }
        }

        if self.config.mock_ha {
            let png = synthetic_png(req.viewport.width, req.viewport.height);
            let image = image_pipeline::process(
                png,
                &ProcessOptions {
                    format: req.format,
                    rotate: req.rotate,
                    invert: req.invert,
                    dithering: req.dithering,
                },
            )
            .await?;
            return Ok(CaptureOutcome { image, elapsed: Duration::from_millis(1) });
        }

        let _guard = self.acquire_in_flight()?;
        let start = Instant::now();

        let mut state_guard = self.state.lock().await;
        let state = state_guard
            .as_mut()
            .ok_or_else(|| EngineError::BrowserCrash("capture called before navigate".into()))?;

        let header = (constants::HEADER_HEIGHT as f64 * req.zoom) as i64;
        let clip = match req.crop {
            Some(crop) => ClipRegion::builder()
                .x(crop.x as f64)
                .y((header as u32 + crop.y) as f64)
                .width(crop.width as f64)
                .height(crop.height as f64)
                .scale(1.0)
                .build()
                .map_err(|err| EngineError::ImagePipelineError(err.to_string()))?,
            None => ClipRegion::builder()
                .x(0.0)
                .y(header as f64)
                .width(req.viewport.width as f64)
                .height((req.viewport.height as i64 - header).max(0) as f64)
                .scale(1.0)
                .build()
                .map_err(|err| EngineError::ImagePipelineError(err.to_string()))?,
        };

        let params = CaptureScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .clip(clip)
            .build();

        let png_capture_result = state.page.screenshot(params).await;

        if state.page_error.load(Ordering::SeqCst) {
            drop(state_guard);
            self.invalidate_last_path().await;
            return Err(EngineError::PageCorrupted("pageErrorDetected during capture".into()));
        }

        let png = match png_capture_result {
            Ok(bytes) => bytes,
            Err(err) => {
                drop(state_guard);
                self.invalidate_last_path().await;
                return Err(classify(&err.to_string()));
            }
        };

        let image = image_pipeline::process(
            png,
            &ProcessOptions {
                format: req.format,
                rotate: req.rotate,
                invert: req.invert,
                dithering: req.dithering,
            },
        )
        .await?;

        Ok(CaptureOutcome { image, elapsed: start.elapsed() })
    }

    async fn invalidate_last_path(&self) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.cache.last_path = None;
        }
    }

    /// Destroys the subprocess, invalidating all cached state. Used by the
    /// Serializer's idle/proactive cleanup and by the Facade's recovery
    /// protocol. Errors during teardown are swallowed.
    pub async fn destroy(&self) {
        let mut state_guard = self.state.lock().await;
        if let Some(state) = state_guard.take() {
            let _ = state.browser.close().await;
            state.handler.abort();
            info!("browser subprocess destroyed");
        }
    }

    /// Verifies the subprocess is present and responsive within a bounded
    /// timeout.
    pub async fn liveness_probe(&self) -> bool {
        if self.config.mock_ha {
            return true;
        }
        let timeout = Duration::from_millis(constants::LIVENESS_PROBE_TIMEOUT_MS);
        let state_guard = self.state.lock().await;
        let Some(state) = state_guard.as_ref() else { return false };
        tokio::time::timeout(timeout, state.page.evaluate("1+1")).await.is_ok_and(|r| r.is_ok())
    }

    async fn launch(&self) -> Result<BrowserState, EngineError> {
        let browser_config = build_browser_config();
        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|err| EngineError::BrowserCrash(err.to_string()))?;

        let page_error = Arc::new(AtomicBool::new(false));
        let disconnected = Arc::new(AtomicBool::new(false));
        let disconnect_flag = disconnected.clone();
        let page_error_flag = page_error.clone();

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    page_error_flag.store(true, Ordering::SeqCst);
                }
            }
            disconnect_flag.store(true, Ordering::SeqCst);
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| EngineError::BrowserCrash(err.to_string()))?;

        inject_auth_token(&page, &self.config).await?;

        Ok(BrowserState {
            browser,
            handler: handler_task,
            page,
            cache: PageCache::default(),
            page_error,
            disconnected,
        })
    }
}

fn build_browser_config() -> BrowserConfig {
    let args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--no-first-run".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!("--user-data-dir=/tmp/ha-eink-screenshot-{}", std::process::id()),
    ];

    BrowserConfig::builder()
        .args(args)
        .build()
        .unwrap_or_else(|_| BrowserConfig::with_executable("/usr/bin/chromium"))
}

/// Seeds Home Assistant's local-storage auth tokens before any page script
/// runs, via `Page.addScriptToEvaluateOnNewDocument`.
async fn inject_auth_token(page: &Page, config: &AppConfig) -> Result<(), EngineError> {
    let token = config.access_token.clone().unwrap_or_default();
    let ha_url = config.home_assistant_url.trim_end_matches('/');
    let script = format!(
        r#"
        (function() {{
            const authObj = {{
                access_token: "{token}",
                token_type: "Bearer",
                hassUrl: "{ha_url}",
                clientId: "{ha_url}/",
                expires: 9999999999999,
                expires_in: 1800,
                refresh_token: ""
            }};
            localStorage.setItem("hassTokens", JSON.stringify(authObj));
            localStorage.setItem("dockedSidebar", JSON.stringify("always_hidden"));
            localStorage.setItem("selectedTheme", JSON.stringify({{"dark": false}}));
        }})();
        "#
    );

    let params = AddScriptToEvaluateOnNewDocumentParams::builder()
        .source(script)
        .build()
        .map_err(|err| EngineError::BrowserCrash(err.to_string()))?;
    page.execute(params).await.map_err(|err| EngineError::BrowserCrash(err.to_string()))?;
    Ok(())
}

async fn dispatch_route_change(page: &Page, path: &str) -> Result<(), EngineError> {
    let script = format!(
        r#"window.history.pushState(null, "", "{path}");
           window.dispatchEvent(new PopStateEvent("popstate"));"#
    );
    page.evaluate(script).await.map_err(|err| classify(&err.to_string()))?;
    Ok(())
}

async fn wait_for_ha_loading_to_clear(page: &Page) {
    let deadline = Instant::now() + Duration::from_millis(constants::HA_LOADING_CAP_MS);
    loop {
        let still_loading = page
            .evaluate(
                "document.querySelector('home-assistant') && \
                 document.querySelector('home-assistant').shadowRoot && \
                 document.querySelector('home-assistant').shadowRoot.querySelector('._loading') !== null",
            )
            .await
            .ok()
            .and_then(|r| r.value().cloned())
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !still_loading || Instant::now() >= deadline {
            return;
        }
        sleep(Duration::from_millis(constants::HA_LOADING_POLL_MS)).await;
    }
}

async fn dismiss_active_toast(page: &Page) -> bool {
    page.evaluate(
        r#"(function() {
            const ha = document.querySelector('home-assistant');
            const toast = ha && ha.shadowRoot && ha.shadowRoot.querySelector('notification-manager');
            if (toast) { toast.remove(); return true; }
            return false;
        })();"#,
    )
    .await
    .ok()
    .and_then(|r| r.value().cloned())
    .and_then(|v| v.as_bool())
    .unwrap_or(false)
}

async fn set_page_zoom(page: &Page, zoom: f64) -> Result<(), EngineError> {
    let script = format!("document.body.style.zoom = '{zoom}';");
    page.evaluate(script).await.map_err(|err| classify(&err.to_string()))?;
    Ok(())
}

async fn set_language(page: &Page, lang: &str) -> Result<(), EngineError> {
    let script = format!(
        r#"document.dispatchEvent(new CustomEvent("hass-language-select", {{ detail: "{lang}" }}));"#
    );
    page.evaluate(script).await.map_err(|err| classify(&err.to_string()))?;
    Ok(())
}

async fn dispatch_set_theme(page: &Page, theme: Option<&str>, dark: bool) -> Result<(), EngineError> {
    let theme_json = theme.map(|t| format!("\"{t}\"")).unwrap_or_else(|| "null".to_string());
    let script = format!(
        r#"document.dispatchEvent(new CustomEvent("settheme", {{ detail: {{ theme: {theme_json}, dark: {dark} }} }}));"#
    );
    page.evaluate(script).await.map_err(|err| classify(&err.to_string()))?;
    Ok(())
}

/// Polls document scroll height and shadow-root content length; stops after
/// three consecutive identical readings, bounded by `bound`.
async fn smart_wait(page: &Page, bound: Duration) {
    let deadline = Instant::now() + bound;
    let mut last_reading: Option<i64> = None;
    let mut stable_count = 0;

    while Instant::now() < deadline {
        let reading = page
            .evaluate(
                "document.body.scrollHeight + (document.querySelector('home-assistant') && \
                 document.querySelector('home-assistant').shadowRoot ? \
                 document.querySelector('home-assistant').shadowRoot.innerHTML.length : 0)",
            )
            .await
            .ok()
            .and_then(|r| r.value().cloned())
            .and_then(|v| v.as_i64());

        if reading.is_some() && reading == last_reading {
            stable_count += 1;
            if stable_count >= 3 {
                return;
            }
        } else {
            stable_count = 0;
            last_reading = reading;
        }
        sleep(Duration::from_millis(constants::SMART_WAIT_POLL_MS)).await;
    }
}

fn classify(message: &str) -> EngineError {
    if EngineError::message_indicates_crash(message) {
        EngineError::BrowserCrash(message.to_string())
    } else {
        EngineError::PageCorrupted(message.to_string())
    }
}

fn classify_navigation(message: &str, path: &str) -> EngineError {
    if EngineError::message_indicates_crash(message) {
        return EngineError::BrowserCrash(message.to_string());
    }
    EngineError::CannotOpenPage {
        status: 0,
        path: path.to_string(),
        network_error: Some(message.to_string()),
    }
}

/// Mock HA mode: a flat-white PNG sized to the requested viewport, so the
/// rest of the pipeline (rotation, dithering, format encoding) is
/// exercisable without a reachable Chrome/HA instance. Hand-encoded rather
/// than pulled in from an image crate, since this is the only place in the
/// crate that needs to produce pixel data rather than transform it.
fn synthetic_png(width: u32, height: u32) -> Vec<u8> {
    let width = width.max(1);
    let height = height.max(1);
    let row_stride = width as usize * 3;

    let mut raw = Vec::with_capacity(height as usize * (1 + row_stride));
    for _ in 0..height {
        raw.push(0); // filter type: None
        raw.extend(std::iter::repeat(0xFFu8).take(row_stride));
    }

    let mut png = Vec::new();
    png.extend_from_slice(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]);
    write_chunk(&mut png, b"IHDR", &ihdr(width, height));
    write_chunk(&mut png, b"IDAT", &zlib_stored(&raw));
    write_chunk(&mut png, b"IEND", &[]);
    png
}

fn ihdr(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(13);
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&[8, 2, 0, 0, 0]); // 8-bit depth, RGB, default compression/filter/interlace
    data
}

fn write_chunk(out: &mut Vec<u8>, chunk_type: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    let mut crc_input = Vec::with_capacity(4 + data.len());
    crc_input.extend_from_slice(chunk_type);
    crc_input.extend_from_slice(data);
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc32(&crc_input).to_be_bytes());
}

/// Wraps `data` in a zlib stream made entirely of uncompressed ("stored")
/// deflate blocks, since the pixel data is flat and compression buys
/// nothing here.
fn zlib_stored(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 65535 * 5 + 11);
    out.extend_from_slice(&[0x78, 0x01]);

    let mut offset = 0;
    loop {
        let remaining = data.len() - offset;
        let block_len = remaining.min(65535);
        let is_final = offset + block_len >= data.len();
        out.push(if is_final { 1 } else { 0 });
        out.extend_from_slice(&(block_len as u16).to_le_bytes());
        out.extend_from_slice(&!(block_len as u16).to_le_bytes());
        out.extend_from_slice(&data[offset..offset + block_len]);
        offset += block_len;
        if is_final {
            break;
        }
    }

    out.extend_from_slice(&adler32(data).to_be_bytes());
    out
}

fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let (mut a, mut b) = (1u32, 0u32);
    for &byte in data {
        a = (a + byte as u32) % MOD_ADLER;
        b = (b + a) % MOD_ADLER;
    }
    (b << 16) | a
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
        }
    }
    crc ^ 0xFFFF_FFFF
}

impl std::fmt::Debug for BrowserDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserDriver").field("mock_ha", &self.config.mock_ha).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_crash_markers() {
        assert!(matches!(classify("Protocol error"), EngineError::BrowserCrash(_)));
        assert!(matches!(classify("some other error"), EngineError::PageCorrupted(_)));
    }

    #[test]
    fn classifies_navigation_failure_as_cannot_open_page() {
        match classify_navigation("net::ERR_NAME_NOT_RESOLVED", "/lovelace/0") {
            EngineError::CannotOpenPage { path, .. } => assert_eq!(path, "/lovelace/0"),
            other => panic!("expected CannotOpenPage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_mode_navigate_and_capture_do_not_touch_a_real_browser() {
        let config = Arc::new(AppConfig { mock_ha: true, ..AppConfig::default() });
        let driver = BrowserDriver::new(config);
        let req = crate::request::parse(
            "/lovelace/0",
            &[("viewport".to_string(), "800x480".to_string())].into_iter().collect(),
        )
        .unwrap();

        let nav = driver.navigate(&req).await.unwrap();
        assert!(nav.elapsed.as_millis() < 100);

        let capture = driver.capture(&req).await.unwrap();
        assert!(!capture.image.is_empty());
        assert!(!driver.is_present().await);

        let (decoded_width, decoded_height) = png_dimensions(&capture.image);
        assert_eq!((decoded_width, decoded_height), (800, 480));
    }

    #[tokio::test]
    async fn capture_rejects_crop_exceeding_viewport() {
        let config = Arc::new(AppConfig { mock_ha: true, ..AppConfig::default() });
        let driver = BrowserDriver::new(config);
        let req = crate::request::parse(
            "/lovelace/0",
            &[
                ("viewport".to_string(), "800x480".to_string()),
                ("crop_x".to_string(), "700".to_string()),
                ("crop_y".to_string(), "0".to_string()),
                ("crop_width".to_string(), "200".to_string()),
                ("crop_height".to_string(), "100".to_string()),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap();

        let err = driver.capture(&req).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[test]
    fn synthetic_png_is_sized_to_the_requested_viewport() {
        let png = synthetic_png(200, 100);
        assert_eq!(png_dimensions(&png), (200, 100));
    }

    fn png_dimensions(png: &[u8]) -> (u32, u32) {
        let width = u32::from_be_bytes(png[16..20].try_into().unwrap());
        let height = u32::from_be_bytes(png[20..24].try_into().unwrap());
        (width, height)
    }
}
