//! Captured frames, YUYV/GREY/Y16 to RGB conversion and dark-frame checks.

use image::{Rgb, RgbImage};

/// Pixels darker than this luma count toward a dark frame.
const DARK_LUMA: u8 = 32;

/// A captured camera frame converted to RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let n = (self.image.width() * self.image.height()) as usize;
        if n == 0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(p) as f32).sum::<f32>() / n as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to RGB using full-range BT.601.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("YUYV", yuyv, pixels * 2)?;

    let mut rgb = RgbImage::new(width, height);
    for (i, p) in rgb.pixels_mut().enumerate() {
        let pair = (i / 2) * 4;
        let y = yuyv[i * 2] as f32;
        let u = yuyv.get(pair + 1).copied().unwrap_or(128) as f32 - 128.0;
        let v = yuyv.get(pair + 3).copied().unwrap_or(128) as f32 - 128.0;

        let r = y + 1.402 * v;
        let g = y - 0.344_136 * u - 0.714_136 * v;
        let b = y + 1.772 * u;
        *p = Rgb([clamp_u8(r), clamp_u8(g), clamp_u8(b)]);
    }
    Ok(rgb)
}

/// Expand 8-bit grayscale to RGB by channel replication.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", gray, pixels)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let v = gray[(y * width + x) as usize];
        Rgb([v, v, v])
    }))
}

/// Downscale 16-bit little-endian grayscale to 8 bits and expand to RGB.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("Y16", buf, pixels * 2)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let idx = (y * width + x) as usize * 2;
        let value = u16::from_le_bytes([buf[idx], buf[idx + 1]]);
        let v = (value >> 8) as u8;
        Rgb([v, v, v])
    }))
}

/// BT.601 luma of an RGB pixel.
pub fn luma(p: &Rgb<u8>) -> u8 {
    let [r, g, b] = p.0;
    clamp_u8(0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
}

/// Returns true if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = (image.width() * image.height()) as usize;
    if total == 0 {
        return true;
    }
    let dark_count = image.pixels().filter(|p| luma(p) < DARK_LUMA).count();
    (dark_count as f32 / total as f32) > threshold_pct
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}
