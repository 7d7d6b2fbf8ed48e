//! Image → embedding: localize, pick the largest face, crop, normalize, embed.

use crate::detector::{DetectorError, FaceLocator};
use crate::preprocess;
use crate::recognizer::{FaceEmbedder, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detected face lies outside the image")]
    EmptyCrop,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// A face embedding together with the box it was taken from.
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    pub face: BoundingBox,
    pub embedding: Embedding,
}

/// Embed the largest face in `image`.
pub fn embed_largest_face<L, E>(
    image: &RgbImage,
    locator: &mut L,
    embedder: &mut E,
) -> Result<FaceEmbedding, PipelineError>
where
    L: FaceLocator + ?Sized,
    E: FaceEmbedder + ?Sized,
{
    let faces = locator.locate(image)?;
    let face = preprocess::largest_face(&faces)
        .ok_or(PipelineError::NoFaceDetected)?
        .clone();

    let crop = preprocess::crop_face(image, &face).ok_or(PipelineError::EmptyCrop)?;
    let (w, h) = embedder.input_size();
    let normalized = preprocess::preprocess(&crop, w, h);
    let embedding = embedder.embed(&normalized)?;

    tracing::debug!(
        faces = faces.len(),
        width = face.width,
        height = face.height,
        confidence = face.confidence,
        "embedded largest face"
    );

    Ok(FaceEmbedding { face, embedding })
}

/// Deterministic stand-ins for the ONNX models.
#[cfg(test)]
pub(crate) mod stubs {
    use super::*;

    /// Reports one face covering the whole image unless the top-left pixel
    /// is pure black.
    pub struct StubLocator;

    impl FaceLocator for StubLocator {
        fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            if image.get_pixel(0, 0).0 == [0, 0, 0] {
                return Ok(Vec::new());
            }
            let (w, h) = image.dimensions();
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: w as f32,
                height: h as f32,
                confidence: 0.99,
            }])
        }
    }

    /// Embeds a crop as its mean red, green and blue values / 255.
    /// Fails on crops that are almost entirely blue-saturated.
    pub struct StubEmbedder;

    impl FaceEmbedder for StubEmbedder {
        fn input_size(&self) -> (u32, u32) {
            (8, 8)
        }

        fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
            let n = (face.width() * face.height()) as f32;
            let mut sums = [0.0f32; 3];
            for p in face.pixels() {
                for c in 0..3 {
                    sums[c] += p[c] as f32;
                }
            }
            let values: Vec<f32> = sums.iter().map(|s| s / n / 255.0).collect();
            if values[2] > 0.99 {
                return Err(RecognizerError::InferenceFailed("stub failure".into()));
            }
            Ok(Embedding::new(values, Some("stub".into())))
        }
    }

    /// A solid-color image; black makes `StubLocator` find nothing.
    pub fn solid(rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(16, 16, image::Rgb(rgb))
    }
}
