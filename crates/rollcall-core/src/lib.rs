//! rollcall-core: face-recognition attendance engine.
//!
//! Uses SCRFD for face localization and ArcFace for embeddings, both via
//! ONNX Runtime, then classifies embeddings against an enrollment database
//! with a KNN majority vote and marks attendance on confident matches.

pub mod database;
pub mod detector;
pub mod ledger;
pub mod matcher;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod session;
pub mod types;

use std::path::PathBuf;

pub use database::{BuildStats, DatabaseError, EnrollmentDatabase, LabeledImage};
pub use detector::{DetectorProfile, FaceDetector, FaceLocator};
pub use ledger::{AttendanceStatus, IdentityEntry, LedgerError, Roster};
pub use matcher::{KnnMatcher, MatchError, MatchParams, Matcher};
pub use recognizer::{FaceEmbedder, FaceRecognizer};
pub use session::{AttendanceOutcome, Session, SessionError};
pub use types::{BoundingBox, Embedding, FeatureRecord, MatchDecision};

/// File name of the SCRFD localizer model.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace extractor model.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
