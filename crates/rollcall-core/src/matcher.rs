//! K-nearest-neighbor majority vote with a distance confidence gate.
//!
//! A query is accepted as identity `X` only when `X` holds at least
//! `ceil(K/2)` of the `K` nearest records and the mean distance over those
//! agreeing records is below the threshold. The mean excludes
//! neighbors that voted for other labels.

use crate::database::EnrollmentDatabase;
use crate::types::{Embedding, MatchDecision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_K: usize = 3;
pub const DEFAULT_THRESHOLD: f32 = 1.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Runtime-tunable matching parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchParams {
    /// Neighbors consulted per query.
    pub k: usize,
    /// Maximum accepted mean distance of the majority label.
    pub threshold: f32,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl MatchParams {
    pub fn new(k: usize, threshold: f32) -> Result<Self, MatchError> {
        validate_k(k)?;
        validate_threshold(threshold)?;
        Ok(Self { k, threshold })
    }

    /// `k` clamped to `[1, db_len]`.
    pub fn effective_k(&self, db_len: usize) -> usize {
        self.k.clamp(1, db_len.max(1))
    }
}

pub(crate) fn validate_k(k: usize) -> Result<(), MatchError> {
    if k == 0 {
        return Err(MatchError::InvalidArgument("k must be at least 1".into()));
    }
    Ok(())
}

pub(crate) fn validate_threshold(threshold: f32) -> Result<(), MatchError> {
    if !threshold.is_finite() || threshold <= 0.0 {
        return Err(MatchError::InvalidArgument(format!(
            "threshold must be a positive finite number, got {threshold}"
        )));
    }
    Ok(())
}

/// Strategy for classifying a query embedding against the enrollment database.
pub trait Matcher {
    fn classify(
        &self,
        query: &Embedding,
        db: &EnrollmentDatabase,
        k: usize,
        threshold: f32,
    ) -> Result<MatchDecision, MatchError>;
}

/// Euclidean KNN majority-vote matcher. Stateless.
///
/// Equal distances keep database insertion order. Equal vote counts go to
/// the lexicographically smallest label.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnnMatcher;

impl Matcher for KnnMatcher {
    fn classify(
        &self,
        query: &Embedding,
        db: &EnrollmentDatabase,
        k: usize,
        threshold: f32,
    ) -> Result<MatchDecision, MatchError> {
        if db.is_empty() {
            return Err(MatchError::InvalidArgument("enrollment database is empty".into()));
        }
        validate_k(k)?;
        if k > db.len() {
            return Err(MatchError::InvalidArgument(format!(
                "k = {k} exceeds database size {}",
                db.len()
            )));
        }
        validate_threshold(threshold)?;
        if !db.accepts(query) {
            return Err(MatchError::InvalidArgument(format!(
                "query embedding ({}-dim, model {:?}) does not match the database \
                 ({:?}-dim, model {:?})",
                query.dimension(),
                query.model_version,
                db.dimension(),
                db.model_version()
            )));
        }

        let records = db.records();
        let mut ranked: Vec<(usize, f32)> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (i, query.euclidean_distance(&r.embedding)))
            .collect();
        // Stable: equal distances stay in insertion order.
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let closest_distance = ranked[0].1;
        let neighbors = &ranked[..k];

        let mut votes: BTreeMap<&str, usize> = BTreeMap::new();
        for &(idx, _) in neighbors {
            *votes.entry(records[idx].identity_id.as_str()).or_insert(0) += 1;
        }

        let mut majority_label = "";
        let mut majority_count = 0usize;
        for (&label, &count) in &votes {
            if count > majority_count {
                majority_label = label;
                majority_count = count;
            }
        }

        let agreeing: Vec<f32> = neighbors
            .iter()
            .filter(|(idx, _)| records[*idx].identity_id == majority_label)
            .map(|&(_, d)| d)
            .collect();
        let confidence_distance = agreeing.iter().sum::<f32>() / agreeing.len() as f32;

        let is_majority = majority_count >= k.div_ceil(2);
        let is_confident = is_majority && confidence_distance < threshold;

        tracing::debug!(
            k,
            label = majority_label,
            votes = majority_count,
            confidence_distance,
            closest_distance,
            is_majority,
            is_confident,
            "knn classification"
        );

        Ok(MatchDecision {
            matched_identity_id: is_confident.then(|| majority_label.to_string()),
            majority_label: majority_label.to_string(),
            majority_count,
            k,
            confidence_distance,
            closest_distance,
            is_majority,
            is_confident,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureRecord;

    fn db_1d(records: &[(&str, f32)]) -> EnrollmentDatabase {
        let mut db = EnrollmentDatabase::new();
        for &(id, x) in records {
            db.push(FeatureRecord {
                identity_id: id.into(),
                embedding: Embedding::new(vec![x], None),
            })
            .unwrap();
        }
        db
    }

    fn q(x: f32) -> Embedding {
        Embedding::new(vec![x], None)
    }

    #[test]
    fn test_confidence_gate_accepts_agreeing_subset() {
        let db = db_1d(&[("B", 5.0), ("A", 0.1), ("A", 0.2)]);
        let d = KnnMatcher.classify(&q(0.0), &db, 3, 1.0).unwrap();
        assert_eq!(d.majority_label, "A");
        assert_eq!(d.majority_count, 2);
        assert!(d.is_majority);
        assert!((d.confidence_distance - 0.15).abs() < 1e-6, "got {}", d.confidence_distance);
        assert!(d.is_confident);
        assert_eq!(d.matched_identity_id.as_deref(), Some("A"));
    }

    #[test]
    fn test_confidence_gate_rejects_and_reports_closest() {
        let db = db_1d(&[("B", 5.0), ("A", 0.1), ("A", 0.2)]);
        let d = KnnMatcher.classify(&q(0.0), &db, 3, 0.1).unwrap();
        assert!(d.is_majority);
        assert!(!d.is_confident);
        assert_eq!(d.matched_identity_id, None);
        assert!((d.closest_distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_closest_distance_spans_whole_database() {
        // Nearest record is a lone "C"; the K=3 vote goes to "A".
        let db = db_1d(&[("C", 0.05), ("A", 0.3), ("A", 0.4), ("B", 9.0)]);
        let d = KnnMatcher.classify(&q(0.0), &db, 3, 1.0).unwrap();
        assert_eq!(d.majority_label, "A");
        assert!((d.closest_distance - 0.05).abs() < 1e-6);
        assert!((d.confidence_distance - 0.35).abs() < 1e-6);
    }

    #[test]
    fn test_unanimous_majority_any_parity() {
        let db = db_1d(&[("A", 1.0), ("A", 2.0), ("A", 3.0), ("A", 4.0), ("B", 50.0)]);
        for k in 1..=4 {
            let d = KnnMatcher.classify(&q(0.0), &db, k, 100.0).unwrap();
            assert!(d.is_majority, "k = {k}");
            assert_eq!(d.majority_count, k);
        }
    }

    #[test]
    fn test_tie_is_majority_and_deterministic() {
        let db = db_1d(&[("B", 0.1), ("A", 0.2), ("B", 0.3), ("A", 0.4), ("C", 10.0)]);
        let first = KnnMatcher.classify(&q(0.0), &db, 4, 1.0).unwrap();
        assert_eq!(first.majority_count, 2);
        assert!(first.is_majority);
        assert!(first.majority_label == "A" || first.majority_label == "B");
        for _ in 0..10 {
            assert_eq!(KnnMatcher.classify(&q(0.0), &db, 4, 1.0).unwrap(), first);
        }
    }

    #[test]
    fn test_split_vote_is_not_majority() {
        let db = db_1d(&[("A", 0.1), ("B", 0.2), ("C", 0.3)]);
        let d = KnnMatcher.classify(&q(0.0), &db, 3, 10.0).unwrap();
        assert_eq!(d.majority_count, 1);
        assert!(!d.is_majority);
        assert!(!d.is_confident);
        assert_eq!(d.matched_identity_id, None);
    }

    #[test]
    fn test_equal_distances_keep_insertion_order() {
        // Both records at distance 1; K=1 must pick the first inserted.
        let db = db_1d(&[("late", 1.0), ("early", -1.0)]);
        let d = KnnMatcher.classify(&q(0.0), &db, 1, 5.0).unwrap();
        assert_eq!(d.majority_label, "late");
    }

    #[test]
    fn test_result_label_is_enrolled_or_none() {
        let labels = ["ada", "alan", "grace", "linus"];
        let mut db = EnrollmentDatabase::new();
        let mut seed = 12345u32;
        let mut next = || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            (seed >> 16) as f32 / 65536.0
        };
        for i in 0..24 {
            db.push(FeatureRecord {
                identity_id: labels[i % labels.len()].into(),
                embedding: Embedding::new(vec![next(), next(), next()], None),
            })
            .unwrap();
        }

        for _ in 0..50 {
            let query = Embedding::new(vec![next(), next(), next()], None);
            for k in 1..=db.len() {
                let d = KnnMatcher.classify(&query, &db, k, 0.4).unwrap();
                if let Some(id) = &d.matched_identity_id {
                    assert!(labels.contains(&id.as_str()));
                    assert!(d.is_confident);
                } else {
                    assert!(!d.is_confident);
                }
            }
        }
    }

    #[test]
    fn test_invalid_arguments() {
        let db = db_1d(&[("A", 0.0), ("B", 1.0)]);
        let bad =
            |r: Result<MatchDecision, MatchError>| matches!(r, Err(MatchError::InvalidArgument(_)));

        assert!(bad(KnnMatcher.classify(&q(0.0), &db, 0, 1.0)));
        assert!(bad(KnnMatcher.classify(&q(0.0), &db, 3, 1.0)));
        assert!(bad(KnnMatcher.classify(&q(0.0), &db, 1, 0.0)));
        assert!(bad(KnnMatcher.classify(&q(0.0), &db, 1, -1.0)));
        assert!(bad(KnnMatcher.classify(&q(0.0), &db, 1, f32::NAN)));
        assert!(bad(KnnMatcher.classify(&q(0.0), &EnrollmentDatabase::new(), 1, 1.0)));
        assert!(bad(KnnMatcher.classify(&Embedding::new(vec![0.0, 0.0], None), &db, 1, 1.0)));
    }

    #[test]
    fn test_rejects_query_from_other_model() {
        let mut db = EnrollmentDatabase::new();
        db.push(FeatureRecord {
            identity_id: "A".into(),
            embedding: Embedding::new(vec![0.0], Some("w600k_r50".into())),
        })
        .unwrap();
        let query = Embedding::new(vec![0.0], Some("other".into()));
        assert!(KnnMatcher.classify(&query, &db, 1, 1.0).is_err());
    }

    #[test]
    fn test_params_effective_k_clamps() {
        let params = MatchParams::new(5, 1.0).unwrap();
        assert_eq!(params.effective_k(3), 3);
        assert_eq!(params.effective_k(10), 5);
        assert!(MatchParams::new(0, 1.0).is_err());
        assert!(MatchParams::new(1, f32::INFINITY).is_err());
    }
}
