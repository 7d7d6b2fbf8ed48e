use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Box area (`width × height`); negative extents count as zero.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: Option<String>) -> Self {
        Self {
            values,
            model_version,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// True when both embeddings have the same dimension and neither carries
    /// a model version that conflicts with the other's.
    pub fn is_compatible_with(&self, other: &Embedding) -> bool {
        if self.dimension() != other.dimension() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// One enrolled face: an embedding labeled with the identity it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub identity_id: String,
    pub embedding: Embedding,
}

/// Outcome of classifying one query embedding against the enrollment database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchDecision {
    /// Identity accepted by the confidence gate, if any.
    pub matched_identity_id: Option<String>,
    /// Label that won the majority vote, whether or not it was accepted.
    pub majority_label: String,
    /// Number of the `k` neighbors carrying `majority_label`.
    pub majority_count: usize,
    /// Number of neighbors consulted.
    pub k: usize,
    /// Mean distance over the neighbors carrying `majority_label`.
    pub confidence_distance: f32,
    /// Distance to the single nearest record in the whole database.
    pub closest_distance: f32,
    pub is_majority: bool,
    pub is_confident: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding::new(values, None)
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = emb(vec![1.0, 2.0, 3.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_3_4_5() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_compatibility_dimension() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![0.0, 0.0, 0.0]);
        assert!(!a.is_compatible_with(&b));
    }

    #[test]
    fn test_compatibility_model_version() {
        let a = Embedding::new(vec![0.0], Some("w600k_r50".into()));
        let b = Embedding::new(vec![0.0], Some("other".into()));
        let untagged = emb(vec![0.0]);
        assert!(!a.is_compatible_with(&b));
        assert!(a.is_compatible_with(&untagged));
        assert!(a.is_compatible_with(&a.clone()));
    }

    #[test]
    fn test_bbox_area() {
        let b = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 4.0,
            height: 5.0,
            confidence: 0.9,
        };
        assert_eq!(b.area(), 20.0);
        let neg = BoundingBox { width: -4.0, ..b };
        assert_eq!(neg.area(), 0.0);
    }
}
