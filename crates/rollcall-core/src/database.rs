//! Enrollment database: one labeled embedding per enrolled face image.
//!
//! Built once from a batch of labeled images. Images where no face is found,
//! or where localization/extraction fails, are skipped with a warning; only a
//! build that yields no records at all is an error. Record order is insertion
//! order and is preserved through save/load.

use crate::detector::FaceLocator;
use crate::ledger::Roster;
use crate::pipeline::{self, PipelineError};
use crate::recognizer::FaceEmbedder;
use crate::types::{Embedding, FeatureRecord};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions accepted as enrollment images.
const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("enrollment produced no usable face records")]
    EmptyDatabase,
    #[error(
        "embedding for {identity_id:?} ({actual_dim}-dim, model {actual_model:?}) does not match \
         the database ({expected_dim}-dim, model {expected_model:?})"
    )]
    IncompatibleEmbedding {
        identity_id: String,
        expected_dim: usize,
        expected_model: Option<String>,
        actual_dim: usize,
        actual_model: Option<String>,
    },
    #[error("enrollment directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ordered collection of enrolled face records.
///
/// All records share the embedding dimension and model version of the first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrollmentDatabase {
    records: Vec<FeatureRecord>,
}

#[derive(Deserialize)]
struct DatabaseFile {
    records: Vec<FeatureRecord>,
}

/// Counters from one enrollment build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub images_seen: usize,
    pub skipped_no_face: usize,
    pub skipped_failed: usize,
    pub records: usize,
}

/// An enrollment image on disk and the identity it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledImage {
    pub identity_id: String,
    pub path: PathBuf,
}

impl EnrollmentDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a database from labeled images.
    ///
    /// For each image the largest detected face is cropped, normalized and
    /// embedded. Per-image failures are logged and skipped.
    pub fn build<I, L, E>(
        images: I,
        locator: &mut L,
        embedder: &mut E,
    ) -> Result<(Self, BuildStats), DatabaseError>
    where
        I: IntoIterator<Item = (String, RgbImage)>,
        L: FaceLocator + ?Sized,
        E: FaceEmbedder + ?Sized,
    {
        let mut db = Self::new();
        let mut stats = BuildStats::default();

        for (identity_id, image) in images {
            stats.images_seen += 1;

            match pipeline::embed_largest_face(&image, locator, embedder) {
                Ok(found) => {
                    let record = FeatureRecord {
                        identity_id,
                        embedding: found.embedding,
                    };
                    if let Err(e) = db.push(record) {
                        stats.skipped_failed += 1;
                        tracing::warn!(
                            error = %e,
                            "incompatible embedding; skipping enrollment image"
                        );
                    }
                }
                Err(PipelineError::NoFaceDetected) => {
                    stats.skipped_no_face += 1;
                    tracing::warn!(
                        identity = %identity_id,
                        "no face detected; skipping enrollment image"
                    );
                }
                Err(e) => {
                    stats.skipped_failed += 1;
                    tracing::warn!(
                        identity = %identity_id,
                        error = %e,
                        "face processing failed; skipping enrollment image"
                    );
                }
            }
        }

        stats.records = db.len();
        tracing::info!(
            images = stats.images_seen,
            records = stats.records,
            no_face = stats.skipped_no_face,
            failed = stats.skipped_failed,
            identities = db.identity_counts().len(),
            "enrollment build finished"
        );

        if db.is_empty() {
            return Err(DatabaseError::EmptyDatabase);
        }
        Ok((db, stats))
    }

    /// Append a record, rejecting embeddings from a different extractor.
    pub fn push(&mut self, record: FeatureRecord) -> Result<(), DatabaseError> {
        if let Some(first) = self.records.first() {
            let expected = &first.embedding;
            if !expected.is_compatible_with(&record.embedding) {
                return Err(DatabaseError::IncompatibleEmbedding {
                    identity_id: record.identity_id,
                    expected_dim: expected.dimension(),
                    expected_model: expected.model_version.clone(),
                    actual_dim: record.embedding.dimension(),
                    actual_model: record.embedding.model_version.clone(),
                });
            }
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[FeatureRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Embedding dimension, or `None` for an empty database.
    pub fn dimension(&self) -> Option<usize> {
        self.records.first().map(|r| r.embedding.dimension())
    }

    pub fn model_version(&self) -> Option<&str> {
        self.records
            .first()
            .and_then(|r| r.embedding.model_version.as_deref())
    }

    /// True when `query` could be compared against every record.
    pub fn accepts(&self, query: &Embedding) -> bool {
        self.records
            .first()
            .map_or(true, |r| r.embedding.is_compatible_with(query))
    }

    /// Number of records per identity.
    pub fn identity_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.identity_id.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), DatabaseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let writer = std::io::BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer(writer, self)?;
        tracing::info!(path = %path.display(), records = self.len(), "enrollment database saved");
        Ok(())
    }

    /// Load a saved database, re-validating embedding consistency.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let reader = std::io::BufReader::new(fs::File::open(path)?);
        let file: DatabaseFile = serde_json::from_reader(reader)?;

        let mut db = Self::new();
        for record in file.records {
            db.push(record)?;
        }
        if db.is_empty() {
            return Err(DatabaseError::EmptyDatabase);
        }

        tracing::info!(
            path = %path.display(),
            records = db.len(),
            dimension = db.dimension(),
            model = db.model_version(),
            "enrollment database loaded"
        );
        Ok(db)
    }
}

/// List enrollment images under `root`, one subdirectory per identity.
///
/// Folder names are matched to the roster case-insensitively and images are
/// labeled with the roster's spelling. Folders with no roster entry and
/// non-image files are skipped with a warning. Output is sorted by folder,
/// then file name.
pub fn scan_enrollment_dir(
    root: impl AsRef<Path>,
    roster: &Roster,
) -> Result<Vec<LabeledImage>, DatabaseError> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(DatabaseError::DirectoryNotFound(root.to_path_buf()));
    }

    let mut labeled = Vec::new();
    for dir in sorted_entries(root)? {
        if !dir.is_dir() {
            continue;
        }
        let Some(folder) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(entry) = roster.get(folder) else {
            tracing::warn!(folder, "enrollment folder has no roster entry; skipping");
            continue;
        };

        for path in sorted_entries(&dir)? {
            if !path.is_file() {
                continue;
            }
            if !is_image_file(&path) {
                tracing::debug!(path = %path.display(), "not an image; skipping");
                continue;
            }
            labeled.push(LabeledImage {
                identity_id: entry.identity_id.clone(),
                path,
            });
        }
    }

    tracing::info!(root = %root.display(), images = labeled.len(), "enrollment directory scanned");
    Ok(labeled)
}

/// Decode labeled images lazily, skipping unreadable files with a warning.
pub fn open_labeled_images(labeled: Vec<LabeledImage>) -> impl Iterator<Item = (String, RgbImage)> {
    labeled.into_iter().filter_map(|item| match image::open(&item.path) {
        Ok(img) => Some((item.identity_id, img.to_rgb8())),
        Err(e) => {
            tracing::warn!(path = %item.path.display(), error = %e, "cannot read image; skipping");
            None
        }
    })
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, DatabaseError> {
    let mut paths = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.sort();
    Ok(paths)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}
