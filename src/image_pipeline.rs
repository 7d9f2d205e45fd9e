//! Image Pipeline.
//!
//! Transforms a raw PNG byte buffer — rotation, dithering, palette mapping,
//! level adjustment, optional inversion, metadata strip, format encoding —
//! via a single invocation of an external ImageMagick-compatible binary.
//! The literal encoder options (`png:compression-level=9`, `-interlace Line
//! -quality 75`, `bmp:format=bmp3`) are ImageMagick CLI conventions; no
//! in-process Rust crate exposes the ordered/Floyd-Steinberg/threshold
//! dithering-to-arbitrary-palette behavior this pipeline needs, so the
//! transform is shelled out to a single `magick` invocation built from an
//! argument vector rather than performed in-process.

use crate::error::EngineError;
use crate::request::{DitherMethod, DitheringOptions, ImageFormat, Rotate};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

/// Options threaded from a `ScreenshotRequest` into the pipeline; kept
/// separate from the request type so callers (capture and Mock HA) can
/// construct it without a full request.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub format: ImageFormat,
    pub rotate: Option<Rotate>,
    pub invert: bool,
    pub dithering: Option<DitheringOptions>,
}

fn magick_binary() -> String {
    std::env::var("IMAGE_MAGICK_BINARY").unwrap_or_else(|_| "magick".to_string())
}

/// Applies rotation, inversion, and format encoding in sequence, picking
/// the fast path when no dithering work is required.
pub async fn process(png: Vec<u8>, opts: &ProcessOptions) -> Result<Vec<u8>, EngineError> {
    if opts.format == ImageFormat::Png && opts.rotate.is_none() && !opts.invert && opts.dithering.is_none() {
        return Ok(png);
    }

    if opts.dithering.is_none() {
        return run_fast_path(png, opts).await;
    }

    run_full_pipeline(png, opts).await
}

async fn run_fast_path(png: Vec<u8>, opts: &ProcessOptions) -> Result<Vec<u8>, EngineError> {
    let mut args = vec!["png:-".to_string()];
    if let Some(rotate) = opts.rotate {
        args.push("-background".into());
        args.push("white".into());
        args.push("-rotate".into());
        args.push(rotate.degrees().to_string());
    }
    if opts.invert {
        args.push("-negate".into());
    }
    args.push("-strip".into());
    push_encode_args(&mut args, opts.format);

    run_magick(png, args).await
}

async fn run_full_pipeline(png: Vec<u8>, opts: &ProcessOptions) -> Result<Vec<u8>, EngineError> {
    let dithering = opts.dithering.as_ref().expect("dithering present by caller contract");
    let mut args = vec!["png:-".to_string()];

    if let Some(rotate) = opts.rotate {
        args.push("-background".into());
        args.push("white".into());
        args.push("-rotate".into());
        args.push(rotate.degrees().to_string());
    }

    if dithering.gamma_correction {
        args.push("-strip".into());
    }

    let mut palette_file: Option<TempPaletteFile> = None;

    if dithering.palette.is_color() {
        if dithering.normalize {
            args.push("-normalize".into());
        }
        if dithering.saturation_boost {
            args.push("-modulate".into());
            args.push("110,150,100".into());
        }
        args.push("-colorspace".into());
        args.push("RGB".into());

        let palette = build_color_palette(dithering.palette.hex_colors()).await?;
        args.push("-dither".into());
        args.push(magick_dither_name(dithering.method).into());
        args.push("-remap".into());
        args.push(palette.path.to_string_lossy().into_owned());
        args.push("-colorspace".into());
        args.push("sRGB".into());
        palette_file = Some(palette);
    } else {
        args.push("-colorspace".into());
        args.push("Gray".into());
        if dithering.black_level != 0 || dithering.white_level != 100 {
            args.push("-level".into());
            args.push(format!("{}%,{}%", dithering.black_level, dithering.white_level));
        }
        push_grayscale_strategy(&mut args, dithering.method, dithering.palette.gray_levels());
    }

    if opts.invert {
        args.push("-negate".into());
    }
    args.push("-strip".into());
    push_encode_args(&mut args, opts.format);

    let result = run_magick(png, args).await;
    drop(palette_file);
    result
}

fn push_grayscale_strategy(args: &mut Vec<String>, method: DitherMethod, levels: u32) {
    match method {
        DitherMethod::FloydSteinberg => {
            args.push("-dither".into());
            args.push("FloydSteinberg".into());
            args.push("-colors".into());
            args.push(levels.to_string());
        }
        DitherMethod::Ordered => {
            args.push("-ordered-dither".into());
            args.push(format!("o8x8,{levels}"));
        }
        DitherMethod::Threshold if levels <= 2 => {
            args.push("-threshold".into());
            args.push("50%".into());
        }
        DitherMethod::Threshold => {
            args.push("-dither".into());
            args.push("None".into());
            args.push("-colors".into());
            args.push(levels.to_string());
        }
    }
}

fn magick_dither_name(method: DitherMethod) -> &'static str {
    match method {
        DitherMethod::FloydSteinberg => "FloydSteinberg",
        DitherMethod::Ordered => "o8x8",
        DitherMethod::Threshold => "None",
    }
}

fn push_encode_args(args: &mut Vec<String>, format: ImageFormat) {
    match format {
        ImageFormat::Png => {
            args.push("-define".into());
            args.push("png:compression-level=9".into());
            args.push("-define".into());
            args.push("png:compression-filter=5".into());
            args.push("-define".into());
            args.push("png:compression-strategy=1".into());
            args.push("png:-".into());
        }
        ImageFormat::Jpeg => {
            args.push("-interlace".into());
            args.push("Line".into());
            args.push("-quality".into());
            args.push("75".into());
            args.push("jpeg:-".into());
        }
        ImageFormat::Bmp => {
            args.push("-define".into());
            args.push("bmp:format=bmp3".into());
            args.push("bmp:-".into());
        }
    }
}

struct TempPaletteFile {
    path: PathBuf,
}

impl Drop for TempPaletteFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove temporary palette file {:?}: {err}", self.path);
            }
        }
    }
}

/// Materializes a 1xN palette image from a fixed hex color list, used as
/// the `-remap` target for color dithering. This preparatory spawn is
/// distinct from the main single-spawn transform pipeline.
async fn build_color_palette(hex_colors: &[&str]) -> Result<TempPaletteFile, EngineError> {
    let path = std::env::temp_dir().join(format!("ha-eink-palette-{}.png", uuid::Uuid::new_v4()));

    let mut args: Vec<String> = hex_colors
        .iter()
        .flat_map(|hex| vec!["xc:".to_string() + hex])
        .collect();
    args.push("+append".into());
    args.push(path.to_string_lossy().into_owned());

    let output = Command::new(magick_binary())
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| EngineError::ImagePipelineError(format!("failed to spawn palette builder: {err}")))?;

    if !output.status.success() {
        return Err(EngineError::ImagePipelineError(format!(
            "palette builder exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(TempPaletteFile { path })
}

async fn run_magick(input: Vec<u8>, args: Vec<String>) -> Result<Vec<u8>, EngineError> {
    let mut child = Command::new(magick_binary())
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| EngineError::ImagePipelineError(format!("failed to spawn image pipeline: {err}")))?;

    let mut stdin = child.stdin.take().expect("stdin requested via Stdio::piped");
    let write_task = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| EngineError::ImagePipelineError(format!("image pipeline process failed: {err}")))?;
    let _ = write_task.await;

    if !output.status.success() {
        return Err(EngineError::ImagePipelineError(format!(
            "image pipeline exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    if output.stdout.is_empty() {
        return Err(EngineError::ImagePipelineError("image pipeline produced empty output".into()));
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Palette;

    #[test]
    fn grayscale_floyd_steinberg_args() {
        let mut args = Vec::new();
        push_grayscale_strategy(&mut args, DitherMethod::FloydSteinberg, 16);
        assert_eq!(args, vec!["-dither", "FloydSteinberg", "-colors", "16"]);
    }

    #[test]
    fn grayscale_threshold_binary_uses_threshold_not_colors() {
        let mut args = Vec::new();
        push_grayscale_strategy(&mut args, DitherMethod::Threshold, 2);
        assert_eq!(args, vec!["-threshold", "50%"]);
    }

    #[test]
    fn grayscale_threshold_multilevel_uses_colors() {
        let mut args = Vec::new();
        push_grayscale_strategy(&mut args, DitherMethod::Threshold, 16);
        assert_eq!(args, vec!["-dither", "None", "-colors", "16"]);
    }

    #[test]
    fn png_encode_args_set_max_compression() {
        let mut args = Vec::new();
        push_encode_args(&mut args, ImageFormat::Png);
        assert_eq!(
            args,
            vec![
                "-define",
                "png:compression-level=9",
                "-define",
                "png:compression-filter=5",
                "-define",
                "png:compression-strategy=1",
                "png:-",
            ]
        );
    }

    #[test]
    fn jpeg_encode_args_set_interlace_and_quality() {
        let mut args = Vec::new();
        push_encode_args(&mut args, ImageFormat::Jpeg);
        assert_eq!(args, vec!["-interlace", "Line", "-quality", "75", "jpeg:-"]);
    }

    #[test]
    fn color_palette_is_color() {
        assert!(Palette::Color6a.is_color());
        assert!(Palette::Color7a.is_color());
        assert!(!Palette::Gray256.is_color());
    }

    #[tokio::test]
    async fn pure_passthrough_skips_processing_entirely() {
        let png = vec![0x89, b'P', b'N', b'G'];
        let opts = ProcessOptions {
            format: ImageFormat::Png,
            rotate: None,
            invert: false,
            dithering: None,
        };
        let out = process(png.clone(), &opts).await.unwrap();
        assert_eq!(out, png);
    }
}
