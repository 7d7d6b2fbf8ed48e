//! ArcFace embedding extractor via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from preprocessed 112×112 RGB
//! face crops, using the w600k_r50 ArcFace model.

use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face crop is {actual:?}, extractor expects {expected:?}")]
    WrongInputSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability: turn a preprocessed face crop into an embedding.
pub trait FaceEmbedder {
    /// Input dimensions (width, height) the crop must be resized to.
    fn input_size(&self) -> (u32, u32);

    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError>;
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Convert a 112×112 RGB crop into a normalized NCHW float tensor.
    fn to_tensor(face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in face.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl FaceEmbedder for FaceRecognizer {
    fn input_size(&self) -> (u32, u32) {
        (ARCFACE_INPUT_SIZE as u32, ARCFACE_INPUT_SIZE as u32)
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let expected = self.input_size();
        if face.dimensions() != expected {
            return Err(RecognizerError::WrongInputSize {
                expected,
                actual: face.dimensions(),
            });
        }

        let input = Self::to_tensor(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw), Some(ARCFACE_MODEL_VERSION.to_string())))
    }
}

/// Scale a vector to unit length; the zero vector is returned unchanged.
pub fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_tensor_output_shape() {
        let face = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = FaceRecognizer::to_tensor(&face);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_tensor_normalization() {
        // 128 - 127.5 = 0.5, / 127.5 ≈ 0.00392
        let face = RgbImage::from_pixel(112, 112, Rgb([128, 0, 255]));
        let tensor = FaceRecognizer::to_tensor(&face);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, 5, 7]] - expected).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 7]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 7]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
