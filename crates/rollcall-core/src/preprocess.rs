//! Face crop normalization applied before embedding extraction.
//!
//! The same steps run at enrollment and at query time: crop the largest
//! detected face, equalize the HSV value channel to normalize lighting, and
//! resize to the extractor's input size.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// Pick the detection with the largest area (`width × height`).
///
/// Equal areas keep the earliest box.
pub fn largest_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().fold(None, |best: Option<&BoundingBox>, face| match best {
        Some(b) if b.area() >= face.area() => Some(b),
        _ => Some(face),
    })
}

/// Crop a bounding box out of an image, clamped to the image bounds.
///
/// Returns `None` when the clamped box has no pixels.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (w, h) = image.dimensions();
    let x0 = face.x.floor().clamp(0.0, w as f32) as u32;
    let y0 = face.y.floor().clamp(0.0, h as f32) as u32;
    let x1 = (face.x + face.width).ceil().clamp(0.0, w as f32) as u32;
    let y1 = (face.y + face.height).ceil().clamp(0.0, h as f32) as u32;

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image())
}

/// Normalize a cropped face: HSV value-channel histogram equalization, then
/// resize to `width × height`.
pub fn preprocess(face: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (w, h) = face.dimensions();
    let pixels = (w * h) as usize;

    let mut hue_sat = Vec::with_capacity(pixels);
    let mut value = Vec::with_capacity(pixels);
    for p in face.pixels() {
        let (hue, sat, v) = rgb_to_hsv(p);
        hue_sat.push((hue, sat));
        value.push(v);
    }

    equalize_histogram(&mut value);

    let mut equalized = RgbImage::new(w, h);
    for (i, p) in equalized.pixels_mut().enumerate() {
        let (hue, sat) = hue_sat[i];
        *p = hsv_to_rgb(hue, sat, value[i]);
    }

    if (w, h) == (width, height) {
        return equalized;
    }
    imageops::resize(&equalized, width, height, FilterType::Triangle)
}

/// Global histogram equalization of an 8-bit channel, in place.
///
/// The lowest occupied level maps to 0 and the cumulative total to 255.
/// A channel holding a single level is left untouched.
pub fn equalize_histogram(channel: &mut [u8]) {
    if channel.is_empty() {
        return;
    }

    let mut hist = [0u32; 256];
    for &v in channel.iter() {
        hist[v as usize] += 1;
    }

    let total = channel.len() as u32;
    let first = hist.iter().position(|&c| c > 0).unwrap_or(0);
    if hist[first] == total {
        return;
    }

    let scale = 255.0 / (total - hist[first]) as f32;
    let mut lut = [0u8; 256];
    let mut sum = 0u32;
    for level in (first + 1)..256 {
        sum += hist[level];
        lut[level] = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }

    for v in channel.iter_mut() {
        *v = lut[*v as usize];
    }
}

/// Split an RGB pixel into hue (sector units, `[0, 6)`), saturation (`[0, 1]`)
/// and 8-bit value.
fn rgb_to_hsv(p: &Rgb<u8>) -> (f32, f32, u8) {
    let [r, g, b] = p.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let chroma = (max - min) as f32;

    let sat = if max == 0 { 0.0 } else { chroma / max as f32 };
    let hue = if chroma == 0.0 {
        0.0
    } else {
        let (r, g, b) = (r as f32, g as f32, b as f32);
        let h = if max == p.0[0] {
            (g - b) / chroma
        } else if max == p.0[1] {
            (b - r) / chroma + 2.0
        } else {
            (r - g) / chroma + 4.0
        };
        h.rem_euclid(6.0)
    };

    (hue, sat, max)
}

fn hsv_to_rgb(hue: f32, sat: f32, value: u8) -> Rgb<u8> {
    let v = value as f32;
    let chroma = v * sat;
    let x = chroma * (1.0 - ((hue % 2.0) - 1.0).abs());
    let m = v - chroma;

    let (r, g, b) = match hue as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };

    let to_u8 = |c: f32| (c + m).round().clamp(0.0, 255.0) as u8;
    Rgb([to_u8(r), to_u8(g), to_u8(b)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_largest_face_by_area() {
        let faces = vec![
            bbox(0.0, 0.0, 10.0, 10.0),
            bbox(50.0, 50.0, 30.0, 20.0),
            bbox(100.0, 0.0, 5.0, 50.0),
        ];
        let best = largest_face(&faces).unwrap();
        assert_eq!(best.x, 50.0);
    }

    #[test]
    fn test_largest_face_empty() {
        assert!(largest_face(&[]).is_none());
    }

    #[test]
    fn test_largest_face_tie_keeps_first() {
        let faces = vec![bbox(1.0, 0.0, 10.0, 10.0), bbox(2.0, 0.0, 10.0, 10.0)];
        assert_eq!(largest_face(&faces).unwrap().x, 1.0);
    }

    #[test]
    fn test_crop_face_clamps_to_bounds() {
        let img = RgbImage::new(100, 80);
        let crop = crop_face(&img, &bbox(-10.0, 60.0, 50.0, 50.0)).unwrap();
        assert_eq!(crop.dimensions(), (40, 20));
    }

    #[test]
    fn test_crop_face_outside_image() {
        let img = RgbImage::new(100, 80);
        assert!(crop_face(&img, &bbox(200.0, 200.0, 10.0, 10.0)).is_none());
    }

    #[test]
    fn test_equalize_uniform_unchanged() {
        let mut channel = vec![77u8; 64];
        equalize_histogram(&mut channel);
        assert!(channel.iter().all(|&v| v == 77));
    }

    #[test]
    fn test_equalize_stretches_range() {
        let mut channel: Vec<u8> = (0..110).map(|i| 100 + (i % 11) as u8).collect();
        equalize_histogram(&mut channel);
        assert_eq!(*channel.iter().min().unwrap(), 0);
        assert_eq!(*channel.iter().max().unwrap(), 255);
    }

    #[test]
    fn test_hsv_roundtrip() {
        for rgb in [[255, 0, 0], [12, 200, 99], [0, 0, 0], [128, 128, 128], [250, 10, 240]] {
            let p = Rgb(rgb);
            let (h, s, v) = rgb_to_hsv(&p);
            assert_eq!(hsv_to_rgb(h, s, v), p, "roundtrip failed for {rgb:?}");
        }
    }

    #[test]
    fn test_preprocess_output_size() {
        let face = RgbImage::from_fn(57, 73, |x, y| Rgb([(x * 3) as u8, (y * 2) as u8, 90]));
        let out = preprocess(&face, 112, 112);
        assert_eq!(out.dimensions(), (112, 112));
    }

    #[test]
    fn test_preprocess_deterministic() {
        let face = RgbImage::from_fn(40, 40, |x, y| Rgb([(x * 5) as u8, (y * 5) as u8, 30]));
        assert_eq!(preprocess(&face, 112, 112), preprocess(&face, 112, 112));
    }

    #[test]
    fn test_preprocess_normalizes_lighting() {
        // Same gradient under dim and bright lighting should converge.
        let dim = RgbImage::from_fn(32, 32, |x, _| Rgb([40 + x as u8, 40 + x as u8, 40 + x as u8]));
        let bright = RgbImage::from_fn(32, 32, |x, _| {
            let v = 180 + x as u8;
            Rgb([v, v, v])
        });
        assert_eq!(preprocess(&dim, 32, 32), preprocess(&bright, 32, 32));
    }
}
