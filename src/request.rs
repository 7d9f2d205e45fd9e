//! Screenshot Request data model and the Parameter Parser.
//!
//! The parser is a pure function: query parameters in, a validated request
//! or an explicit reason out. It never touches the browser or the
//! filesystem, which keeps it trivially unit-testable.

use crate::config::Viewport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Bmp,
}

impl ImageFormat {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => ImageFormat::Jpeg,
            "bmp" => ImageFormat::Bmp,
            _ => ImageFormat::Png,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Bmp => "image/bmp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Bmp => "bmp",
        }
    }
}

/// Rotation applied before encoding. Any angle outside this set is dropped
/// by the parser, not clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Rotate {
    None,
    R90,
    R180,
    R270,
}

impl Rotate {
    pub fn from_degrees(deg: i64) -> Option<Self> {
        match deg {
            90 => Some(Rotate::R90),
            180 => Some(Rotate::R180),
            270 => Some(Rotate::R270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotate::None => 0,
            Rotate::R90 => 90,
            Rotate::R180 => 180,
            Rotate::R270 => 270,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    /// `crop.x + crop.width <= viewport.width`, and the analogous check for
    /// `y`/`height`. Enforced at capture time, not at parse time, since the
    /// parser only has the structural fields to work with.
    pub fn fits_within(&self, viewport: Viewport) -> bool {
        self.x.saturating_add(self.width) <= viewport.width
            && self.y.saturating_add(self.height) <= viewport.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DitherMethod {
    FloydSteinberg,
    Ordered,
    Threshold,
}

impl DitherMethod {
    /// Unknown method names, including `"none"`, fall back to
    /// Floyd-Steinberg rather than to `Threshold`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "ordered" => DitherMethod::Ordered,
            "threshold" => DitherMethod::Threshold,
            _ => DitherMethod::FloydSteinberg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Palette {
    Bw,
    Gray4,
    Gray16,
    Gray256,
    Color6a,
    Color7a,
}

impl Palette {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "gray-4" => Palette::Gray4,
            "gray-16" => Palette::Gray16,
            "gray-256" => Palette::Gray256,
            "color-6a" => Palette::Color6a,
            "color-7a" => Palette::Color7a,
            _ => Palette::Bw,
        }
    }

    pub fn is_color(self) -> bool {
        matches!(self, Palette::Color6a | Palette::Color7a)
    }

    /// Gray level count; meaningless for color palettes.
    pub fn gray_levels(self) -> u32 {
        match self {
            Palette::Bw => 2,
            Palette::Gray4 => 4,
            Palette::Gray16 => 16,
            Palette::Gray256 => 256,
            Palette::Color6a | Palette::Color7a => 0,
        }
    }

    /// Fixed hex color lists for the color palettes.
    pub fn hex_colors(self) -> &'static [&'static str] {
        match self {
            Palette::Color6a => &["#FF0000", "#00FF00", "#0000FF", "#FFFF00", "#000000", "#FFFFFF"],
            Palette::Color7a => &[
                "#FF0000", "#00FF00", "#0000FF", "#FFFF00", "#000000", "#FFFFFF", "#FFA500",
            ],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DitheringOptions {
    pub method: DitherMethod,
    pub palette: Palette,
    pub gamma_correction: bool,
    pub black_level: u8,
    pub white_level: u8,
    pub normalize: bool,
    pub saturation_boost: bool,
}

impl Default for DitheringOptions {
    fn default() -> Self {
        Self {
            method: DitherMethod::FloydSteinberg,
            palette: Palette::Bw,
            gamma_correction: true,
            black_level: 0,
            white_level: 100,
            normalize: false,
            saturation_boost: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScreenshotRequest {
    pub page_path: String,
    pub viewport: Viewport,
    pub zoom: f64,
    pub crop: Option<CropRegion>,
    pub rotate: Option<Rotate>,
    pub invert: bool,
    pub format: ImageFormat,
    pub wait: Option<u64>,
    pub lang: Option<String>,
    pub theme: Option<String>,
    pub dark: bool,
    pub dithering: Option<DitheringOptions>,
    pub next: Option<u64>,
}

/// Reason the Parameter Parser refused a request; the HTTP layer turns this
/// into a 400 with the message as the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn get<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(|s| s.as_str())
}

fn has(params: &HashMap<String, String>, key: &str) -> bool {
    params.contains_key(key)
}

/// Parses a decoded query-parameter map into a `ScreenshotRequest`.
///
/// `page_path` is supplied separately because it comes from the route, not
/// the query string.
pub fn parse(page_path: &str, params: &HashMap<String, String>) -> Result<ScreenshotRequest, ParseError> {
    let viewport = parse_viewport(params)?;

    let zoom = get(params, "zoom")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|z| *z > 0.0)
        .unwrap_or(1.0);

    let rotate = get(params, "rotate")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(Rotate::from_degrees);

    let invert = has(params, "invert");
    let dark = has(params, "dark");

    let format = get(params, "format").map(ImageFormat::parse).unwrap_or(ImageFormat::Png);

    let wait = get(params, "wait").and_then(|v| v.parse::<u64>().ok());

    let next = get(params, "next").and_then(|v| v.parse::<u64>().ok());

    let lang = get(params, "lang").map(str::to_string);
    let theme = get(params, "theme").map(str::to_string);

    let crop = parse_crop(params, viewport);

    let dithering = if has(params, "dithering") {
        Some(parse_dithering(params))
    } else {
        None
    };

    Ok(ScreenshotRequest {
        page_path: page_path.to_string(),
        viewport,
        zoom,
        crop,
        rotate,
        invert,
        format,
        wait,
        lang,
        theme,
        dark,
        dithering,
        next,
    })
}

fn parse_viewport(params: &HashMap<String, String>) -> Result<Viewport, ParseError> {
    let raw = get(params, "viewport").ok_or_else(|| ParseError("viewport is required".into()))?;
    let (w_raw, h_raw) = raw
        .split_once('x')
        .ok_or_else(|| ParseError(format!("invalid viewport: {raw}")))?;
    let width: u32 = w_raw
        .parse()
        .map_err(|_| ParseError(format!("invalid viewport width: {w_raw}")))?;
    let height: u32 = h_raw
        .parse()
        .map_err(|_| ParseError(format!("invalid viewport height: {h_raw}")))?;
    let viewport = Viewport { width, height };
    if !viewport.is_valid() {
        return Err(ParseError(format!("viewport must be positive, got {width}x{height}")));
    }
    Ok(viewport)
}

fn parse_crop(params: &HashMap<String, String>, viewport: Viewport) -> Option<CropRegion> {
    let x = get(params, "crop_x")?.parse::<u32>().ok()?;
    let y = get(params, "crop_y")?.parse::<u32>().ok()?;
    let width = get(params, "crop_width")?.parse::<u32>().ok()?;
    let height = get(params, "crop_height")?.parse::<u32>().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    let crop = CropRegion { x, y, width, height };
    // Only structural completeness is checked here; whether the crop fits
    // the viewport is checked at capture time via `CropRegion::fits_within`.
    let _ = viewport;
    Some(crop)
}

fn parse_dithering(params: &HashMap<String, String>) -> DitheringOptions {
    let method = get(params, "dither_method").map(DitherMethod::parse).unwrap_or(DitherMethod::FloydSteinberg);
    let palette = get(params, "palette").map(Palette::parse).unwrap_or(Palette::Bw);
    let gamma_correction = !has(params, "no_gamma");
    let black_level = get(params, "black_level")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|v| v.clamp(0, 100) as u8)
        .unwrap_or(0);
    let white_level = get(params, "white_level")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|v| v.clamp(0, 100) as u8)
        .unwrap_or(100);
    let normalize = has(params, "normalize");
    let saturation_boost = has(params, "saturation_boost");

    DitheringOptions {
        method,
        palette,
        gamma_correction,
        black_level,
        white_level,
        normalize,
        saturation_boost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn requires_viewport() {
        let err = parse("/lovelace/0", &params(&[])).unwrap_err();
        assert!(err.0.contains("viewport"));
    }

    #[test]
    fn rejects_zero_viewport() {
        let err = parse("/lovelace/0", &params(&[("viewport", "0x0")])).unwrap_err();
        assert!(err.0.contains("positive"));
    }

    #[test]
    fn defaults_apply() {
        let req = parse("/lovelace/0", &params(&[("viewport", "800x480")])).unwrap();
        assert_eq!(req.viewport, Viewport { width: 800, height: 480 });
        assert_eq!(req.zoom, 1.0);
        assert_eq!(req.format, ImageFormat::Png);
        assert!(req.rotate.is_none());
        assert!(!req.invert);
        assert!(req.dithering.is_none());
    }

    #[test]
    fn invalid_rotate_is_dropped_not_defaulted() {
        let req = parse("/lovelace/0", &params(&[("viewport", "800x480"), ("rotate", "45")])).unwrap();
        assert!(req.rotate.is_none());
    }

    #[test]
    fn valid_rotate_is_kept() {
        let req = parse("/lovelace/0", &params(&[("viewport", "800x480"), ("rotate", "90")])).unwrap();
        assert_eq!(req.rotate, Some(Rotate::R90));
    }

    #[test]
    fn unknown_format_falls_back_to_png() {
        let req = parse("/lovelace/0", &params(&[("viewport", "800x480"), ("format", "gif")])).unwrap();
        assert_eq!(req.format, ImageFormat::Png);
    }

    #[test]
    fn incomplete_crop_is_dropped() {
        let req = parse(
            "/lovelace/0",
            &params(&[("viewport", "800x480"), ("crop_x", "10"), ("crop_y", "10")]),
        )
        .unwrap();
        assert!(req.crop.is_none());
    }

    #[test]
    fn complete_crop_is_kept() {
        let req = parse(
            "/lovelace/0",
            &params(&[
                ("viewport", "800x480"),
                ("crop_x", "10"),
                ("crop_y", "10"),
                ("crop_width", "100"),
                ("crop_height", "100"),
            ]),
        )
        .unwrap();
        assert_eq!(
            req.crop,
            Some(CropRegion { x: 10, y: 10, width: 100, height: 100 })
        );
    }

    #[test]
    fn dithering_populated_only_when_flag_present() {
        let req = parse(
            "/lovelace/0",
            &params(&[("viewport", "800x480"), ("dithering", ""), ("palette", "gray-16"), ("no_gamma", "")]),
        )
        .unwrap();
        let dithering = req.dithering.unwrap();
        assert_eq!(dithering.palette, Palette::Gray16);
        assert!(!dithering.gamma_correction);
        assert_eq!(dithering.black_level, 0);
        assert_eq!(dithering.white_level, 100);
    }

    #[test]
    fn black_and_white_level_clamped() {
        let req = parse(
            "/lovelace/0",
            &params(&[
                ("viewport", "800x480"),
                ("dithering", ""),
                ("black_level", "-10"),
                ("white_level", "250"),
            ]),
        )
        .unwrap();
        let dithering = req.dithering.unwrap();
        assert_eq!(dithering.black_level, 0);
        assert_eq!(dithering.white_level, 100);
    }

    #[test]
    fn dither_method_unknown_and_none_both_fall_back_to_floyd_steinberg() {
        assert_eq!(DitherMethod::parse("ordered"), DitherMethod::Ordered);
        assert_eq!(DitherMethod::parse("threshold"), DitherMethod::Threshold);
        assert_eq!(DitherMethod::parse("none"), DitherMethod::FloydSteinberg);
        assert_eq!(DitherMethod::parse("bogus"), DitherMethod::FloydSteinberg);
    }

    #[test]
    fn crop_fits_within_viewport_bounds() {
        let viewport = Viewport { width: 800, height: 480 };
        assert!(CropRegion { x: 0, y: 0, width: 800, height: 480 }.fits_within(viewport));
        assert!(CropRegion { x: 700, y: 0, width: 100, height: 480 }.fits_within(viewport));
        assert!(!CropRegion { x: 700, y: 0, width: 200, height: 100 }.fits_within(viewport));
        assert!(!CropRegion { x: 0, y: 400, width: 100, height: 200 }.fits_within(viewport));
    }

    #[test]
    fn wait_zero_and_absent_are_both_none_downstream_handles_smart_wait() {
        let absent = parse("/lovelace/0", &params(&[("viewport", "800x480")])).unwrap();
        let zero = parse("/lovelace/0", &params(&[("viewport", "800x480"), ("wait", "0")])).unwrap();
        assert_eq!(absent.wait, None);
        assert_eq!(zero.wait, Some(0));
    }
}
