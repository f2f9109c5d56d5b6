//! Raw viewport buffer decoding.
//!
//! The renderer hands back tightly packed pixel buffers in one of a handful of
//! formats. Everything here is pure: bytes in, `image` types out. Two owned
//! image representations leave this module:
//!
//! - [`EncodedImage`]: PNG bytes of a captured buffer, the form injected into
//!   job templates (as base64 text).
//! - [`GeneratedImage`]: tightly packed RGBA8 pixels plus `[width, height]`,
//!   the single in-memory representation of a generation result.

use std::{io::Cursor, path::Path};

use anyhow::Context;
use half::f16;
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage, imageops::FilterType};
use serde::{Deserialize, Serialize};

use crate::error::{UpliftError, UpliftResult};

/// Samples at or beyond this magnitude mean "no geometry hit".
pub const DEPTH_NO_DATA: f32 = 3.402e38;
/// Flipped linear depth mapped to white.
pub const DEPTH_NEAR: f32 = -200.0;
/// Flipped linear depth mapped to black.
pub const DEPTH_FAR: f32 = -600.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba8Unorm,
    R32Float,
    Rgba16Float,
    Rgba32Float,
    /// Anything the host reports that the decoder has no mapping for.
    Other(String),
}

impl PixelFormat {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "rgba8unorm" | "rgba8_unorm" => Self::Rgba8Unorm,
            "r32float" | "r32_sfloat" => Self::R32Float,
            "rgba16float" | "rgba16_sfloat" => Self::Rgba16Float,
            "rgba32float" | "rgba32_sfloat" => Self::Rgba32Float,
            _ => Self::Other(name.to_string()),
        }
    }

    /// `(channels, bytes per channel)` for the supported formats.
    fn layout(&self) -> UpliftResult<(usize, usize)> {
        match self {
            Self::Rgba8Unorm => Ok((4, 1)),
            Self::R32Float => Ok((1, 4)),
            Self::Rgba16Float => Ok((4, 2)),
            Self::Rgba32Float => Ok((4, 4)),
            Self::Other(name) => Err(UpliftError::unsupported_format(name.clone())),
        }
    }
}

/// One buffer as delivered by the renderer's capture callback.
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

pub fn decode_capture(raw: &RawCapture) -> UpliftResult<DynamicImage> {
    decode_pixels(&raw.data, raw.width, raw.height, &raw.format)
}

/// Decode a packed buffer into an 8-bit image.
///
/// - `Rgba8Unorm` is taken as-is.
/// - `R32Float` is linear depth, normalized by [`normalize_linear_depth`] into a grayscale image.
/// - `Rgba16Float` is assumed to be in `[0, 1]`.
/// - `Rgba32Float` is assumed to be in `[-1, 1]` (normals) and remapped to `[0, 1]`.
pub fn decode_pixels(
    bytes: &[u8],
    width: u32,
    height: u32,
    format: &PixelFormat,
) -> UpliftResult<DynamicImage> {
    let (channels, pod_size) = format.layout()?;
    let expected = width as usize * height as usize * channels * pod_size;
    if bytes.len() != expected {
        return Err(UpliftError::decode(format!(
            "{format:?} buffer is {} bytes, expected {expected} for {width}x{height}",
            bytes.len()
        )));
    }

    let image = match format {
        PixelFormat::Rgba8Unorm => {
            DynamicImage::ImageRgba8(rgba_from_raw(width, height, bytes.to_vec())?)
        }
        PixelFormat::R32Float => {
            let samples: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
            let gray = GrayImage::from_raw(width, height, normalize_linear_depth(&samples))
                .ok_or_else(|| UpliftError::decode("depth buffer does not fit its dimensions"))?;
            DynamicImage::ImageLuma8(gray)
        }
        PixelFormat::Rgba16Float => {
            let samples: Vec<f16> = bytemuck::pod_collect_to_vec(bytes);
            let out = samples.iter().map(|v| unit_to_u8(v.to_f32())).collect();
            DynamicImage::ImageRgba8(rgba_from_raw(width, height, out)?)
        }
        PixelFormat::Rgba32Float => {
            let samples: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
            let out = samples.iter().map(|v| unit_to_u8(v * 0.5 + 0.5)).collect();
            DynamicImage::ImageRgba8(rgba_from_raw(width, height, out)?)
        }
        PixelFormat::Other(name) => return Err(UpliftError::unsupported_format(name.clone())),
    };
    Ok(image)
}

/// Map linear depth samples to 8-bit gray.
///
/// Sentinel samples become NaN, the rest are sign-flipped. Finite negative values are remapped
/// from the absolute `[DEPTH_FAR, DEPTH_NEAR]` range into `[0, 1]`. When no finite negative sample
/// exists the whole buffer is white.
pub fn normalize_linear_depth(samples: &[f32]) -> Vec<u8> {
    let flipped: Vec<f32> = samples
        .iter()
        .map(|&v| if v.abs() >= DEPTH_NO_DATA { f32::NAN } else { -v })
        .collect();

    if !flipped.iter().any(|v| v.is_finite() && *v < 0.0) {
        return vec![u8::MAX; samples.len()];
    }

    let range = DEPTH_NEAR - DEPTH_FAR;
    flipped
        .iter()
        .map(|&d| {
            let d = if d.is_finite() { d } else { 0.0 };
            unit_to_u8((d - DEPTH_FAR) / range)
        })
        .collect()
}

fn unit_to_u8(v: f32) -> u8 {
    if !v.is_finite() {
        return 0;
    }
    (v.clamp(0.0, 1.0) * 255.0) as u8
}

fn rgba_from_raw(width: u32, height: u32, data: Vec<u8>) -> UpliftResult<RgbaImage> {
    RgbaImage::from_raw(width, height, data)
        .ok_or_else(|| UpliftError::decode("rgba buffer does not fit its dimensions"))
}

/// Resize towards `target` (`[width, height]`), keeping the source aspect ratio.
///
/// The target height is honoured exactly; the width is `target width * aspect`.
/// A zero component in `target` disables resizing.
pub fn resize_to_target(image: DynamicImage, target: [u32; 2]) -> DynamicImage {
    let [tw, th] = target;
    if tw == 0 || th == 0 || image.height() == 0 {
        return image;
    }
    let aspect = image.width() as f64 / image.height() as f64;
    let width = ((tw as f64 * aspect) as u32).max(1);
    if width == image.width() && th == image.height() {
        return image;
    }
    image.resize_exact(width, th, FilterType::CatmullRom)
}

/// PNG bytes of a captured buffer plus its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn encode_png(image: &DynamicImage) -> UpliftResult<Self> {
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .context("encode buffer as png")?;
        Ok(Self {
            png: out.into_inner(),
            width: image.width(),
            height: image.height(),
        })
    }

    /// The transferable text form injected into template slots.
    pub fn to_base64(&self) -> String {
        use base64::{Engine as _, engine::general_purpose};
        general_purpose::STANDARD.encode(&self.png)
    }

    pub fn decode(&self) -> UpliftResult<DynamicImage> {
        image::load_from_memory(&self.png)
            .map_err(|e| UpliftError::decode(format!("failed to decode png buffer: {e}")))
    }
}

/// A generation result: packed RGBA8 pixels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GeneratedImage {
    /// Zeroed (fully transparent) RGBA image.
    pub fn transparent(width: u32, height: u32) -> Self {
        Self {
            pixels: vec![0; width as usize * height as usize * 4],
            width,
            height,
        }
    }

    /// Decode an image container (PNG, JPEG) returned by the backend.
    pub fn from_encoded(bytes: &[u8]) -> UpliftResult<Self> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| UpliftError::decode(format!("failed to decode artifact: {e}")))?;
        Ok(Self::from_rgba(decoded.to_rgba8()))
    }

    pub fn from_rgba(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
        }
    }

    pub fn size(&self) -> [u32; 2] {
        [self.width, self.height]
    }

    pub fn to_rgba_image(&self) -> UpliftResult<RgbaImage> {
        rgba_from_raw(self.width, self.height, self.pixels.clone())
    }

    /// True when every channel of every pixel is zero (empty bounding box).
    pub fn is_blank(&self) -> bool {
        self.pixels.iter().all(|&b| b == 0)
    }

    pub fn save_png(&self, path: &Path) -> UpliftResult<()> {
        self.to_rgba_image()?
            .save_with_format(path, ImageFormat::Png)
            .with_context(|| format!("failed to save image to {}", path.display()))?;
        Ok(())
    }
}
