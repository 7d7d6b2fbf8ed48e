//! Attendance session: the explicit context tying the enrollment database,
//! the roster and the runtime tunables together.
//!
//! Classification only reads the database and roster; marking someone
//! present and swapping the database take `&mut self`, so a rebuild can never
//! interleave with a classification.

use crate::database::EnrollmentDatabase;
use crate::detector::FaceLocator;
use crate::ledger::{LedgerError, Roster};
use crate::matcher::{validate_k, validate_threshold, KnnMatcher, MatchError, MatchParams, Matcher};
use crate::pipeline::{self, PipelineError};
use crate::recognizer::FaceEmbedder;
use crate::types::{Embedding, MatchDecision};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("enrollment database is empty; re-enroll before matching")]
    EmptyDatabase,
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// What happened to one captured image.
#[derive(Debug, Clone, PartialEq)]
pub enum AttendanceOutcome {
    /// Confident match; the identity is now present.
    Marked {
        identity_id: String,
        display_name: String,
        /// False when the identity had already been marked this session.
        newly_marked: bool,
        decision: MatchDecision,
    },
    /// The confidence gate rejected the vote.
    UnknownMatch { decision: MatchDecision },
    /// The localizer found no face.
    NoFaceDetected,
}

#[derive(Debug)]
pub struct Session<M: Matcher = KnnMatcher> {
    database: EnrollmentDatabase,
    roster: Roster,
    params: MatchParams,
    matcher: M,
}

impl Session<KnnMatcher> {
    pub fn new(
        database: EnrollmentDatabase,
        roster: Roster,
        params: MatchParams,
    ) -> Result<Self, SessionError> {
        Self::with_matcher(database, roster, params, KnnMatcher)
    }
}

impl<M: Matcher> Session<M> {
    /// Create a session with a custom matching strategy. `params.k` is
    /// clamped to the database size.
    pub fn with_matcher(
        database: EnrollmentDatabase,
        roster: Roster,
        params: MatchParams,
        matcher: M,
    ) -> Result<Self, SessionError> {
        if database.is_empty() {
            return Err(SessionError::EmptyDatabase);
        }
        validate_k(params.k)?;
        validate_threshold(params.threshold)?;

        warn_orphans(&database, &roster);

        let mut session = Self {
            database,
            roster,
            params,
            matcher,
        };
        session.clamp_k();
        Ok(session)
    }

    pub fn database(&self) -> &EnrollmentDatabase {
        &self.database
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn params(&self) -> MatchParams {
        self.params
    }

    /// Set K for subsequent calls, clamped to the database size. Returns the
    /// value in effect.
    pub fn set_k(&mut self, k: usize) -> Result<usize, SessionError> {
        validate_k(k)?;
        self.params.k = k;
        self.clamp_k();
        tracing::info!(k = self.params.k, requested = k, "k updated");
        Ok(self.params.k)
    }

    pub fn set_threshold(&mut self, threshold: f32) -> Result<(), SessionError> {
        validate_threshold(threshold)?;
        self.params.threshold = threshold;
        tracing::info!(threshold, "threshold updated");
        Ok(())
    }

    /// Swap in a rebuilt database; K is re-clamped to its size.
    pub fn replace_database(&mut self, database: EnrollmentDatabase) -> Result<(), SessionError> {
        if database.is_empty() {
            return Err(SessionError::EmptyDatabase);
        }
        warn_orphans(&database, &self.roster);
        self.database = database;
        self.clamp_k();
        tracing::info!(
            records = self.database.len(),
            k = self.params.k,
            "enrollment database replaced"
        );
        Ok(())
    }

    fn clamp_k(&mut self) {
        let effective = self.params.effective_k(self.database.len());
        if effective != self.params.k {
            tracing::debug!(from = self.params.k, to = effective, "k clamped to database size");
            self.params.k = effective;
        }
    }

    /// Classify an embedding with the current parameters. Does not touch the roster.
    pub fn classify(&self, query: &Embedding) -> Result<MatchDecision, SessionError> {
        let k = self.params.effective_k(self.database.len());
        Ok(self
            .matcher
            .classify(query, &self.database, k, self.params.threshold)?)
    }

    /// Classify an embedding and mark the matched identity present.
    pub fn identify_embedding(
        &mut self,
        query: &Embedding,
    ) -> Result<AttendanceOutcome, SessionError> {
        let decision = self.classify(query)?;

        let Some(identity_id) = decision.matched_identity_id.clone() else {
            tracing::info!(
                closest = decision.closest_distance,
                label = %decision.majority_label,
                votes = decision.majority_count,
                "no confident match"
            );
            return Ok(AttendanceOutcome::UnknownMatch { decision });
        };

        let receipt = self.roster.mark_present(&identity_id)?;
        Ok(AttendanceOutcome::Marked {
            identity_id,
            display_name: receipt.display_name,
            newly_marked: receipt.newly_marked,
            decision,
        })
    }

    /// Run the live pipeline on one captured image: localize, embed the
    /// largest face, classify, and mark attendance.
    pub fn identify<L, E>(
        &mut self,
        image: &RgbImage,
        locator: &mut L,
        embedder: &mut E,
    ) -> Result<AttendanceOutcome, SessionError>
    where
        L: FaceLocator + ?Sized,
        E: FaceEmbedder + ?Sized,
    {
        match pipeline::embed_largest_face(image, locator, embedder) {
            Ok(found) => self.identify_embedding(&found.embedding),
            Err(PipelineError::NoFaceDetected) => Ok(AttendanceOutcome::NoFaceDetected),
            Err(e) => Err(e.into()),
        }
    }
}

fn warn_orphans(database: &EnrollmentDatabase, roster: &Roster) {
    for (identity, records) in database.identity_counts() {
        if roster.get(identity).is_none() {
            tracing::warn!(identity, records, "enrolled identity missing from roster");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AttendanceStatus;
    use crate::pipeline::stubs::{solid, StubEmbedder, StubLocator};
    use crate::types::FeatureRecord;

    fn db(records: &[(&str, [f32; 2])]) -> EnrollmentDatabase {
        let mut db = EnrollmentDatabase::new();
        for (id, v) in records {
            db.push(FeatureRecord {
                identity_id: id.to_string(),
                embedding: Embedding::new(v.to_vec(), None),
            })
            .unwrap();
        }
        db
    }

    fn roster() -> Roster {
        Roster::new([
            ("ada", "Ada Lovelace"),
            ("alan", "Alan Turing"),
            ("grace", "Grace Hopper"),
        ])
        .unwrap()
    }

    fn three_records() -> EnrollmentDatabase {
        db(&[("ada", [0.0, 0.0]), ("ada", [0.1, 0.0]), ("alan", [5.0, 5.0])])
    }

    #[test]
    fn test_k_clamped_to_database_size() {
        let params = MatchParams::new(5, 1.0).unwrap();
        let session = Session::new(three_records(), roster(), params).unwrap();
        assert_eq!(session.params().k, 3);
        let decision = session.classify(&Embedding::new(vec![0.0, 0.0], None)).unwrap();
        assert_eq!(decision.k, 3);
    }

    #[test]
    fn test_set_k_clamps_and_rejects_zero() {
        let mut session = Session::new(three_records(), roster(), MatchParams::default()).unwrap();
        assert_eq!(session.set_k(10).unwrap(), 3);
        assert_eq!(session.set_k(1).unwrap(), 1);
        assert!(matches!(session.set_k(0), Err(SessionError::Match(_))));
        assert_eq!(session.params().k, 1);
    }

    #[test]
    fn test_set_threshold_validation() {
        let mut session = Session::new(three_records(), roster(), MatchParams::default()).unwrap();
        assert!(session.set_threshold(-0.5).is_err());
        session.set_threshold(0.25).unwrap();
        assert_eq!(session.params().threshold, 0.25);
    }

    #[test]
    fn test_replace_database_reclamps_k() {
        let params = MatchParams::new(3, 1.0).unwrap();
        let mut session = Session::new(three_records(), roster(), params).unwrap();
        session.replace_database(db(&[("grace", [1.0, 1.0])])).unwrap();
        assert_eq!(session.params().k, 1);
        assert!(matches!(
            session.replace_database(EnrollmentDatabase::new()),
            Err(SessionError::EmptyDatabase)
        ));
    }

    #[test]
    fn test_empty_database_rejected() {
        let err =
            Session::new(EnrollmentDatabase::new(), roster(), MatchParams::default()).unwrap_err();
        assert!(matches!(err, SessionError::EmptyDatabase));
    }

    #[test]
    fn test_identify_embedding_marks_once() {
        let params = MatchParams::new(3, 1.0).unwrap();
        let mut session = Session::new(three_records(), roster(), params).unwrap();
        let query = Embedding::new(vec![0.05, 0.0], None);

        let first = session.identify_embedding(&query).unwrap();
        let AttendanceOutcome::Marked {
            identity_id,
            display_name,
            newly_marked,
            ..
        } = &first
        else {
            panic!("expected a match, got {first:?}");
        };
        assert_eq!(identity_id, "ada");
        assert_eq!(display_name, "Ada Lovelace");
        assert!(*newly_marked);

        let second = session.identify_embedding(&query).unwrap();
        assert!(matches!(second, AttendanceOutcome::Marked { newly_marked: false, .. }));
        assert_eq!(session.roster().present_count(), 1);
        assert_eq!(session.roster().get("ada").unwrap().status, AttendanceStatus::Present);
    }

    #[test]
    fn test_identify_embedding_unknown_match() {
        let params = MatchParams::new(3, 0.01).unwrap();
        let mut session = Session::new(three_records(), roster(), params).unwrap();
        let outcome = session.identify_embedding(&Embedding::new(vec![0.05, 0.0], None)).unwrap();
        let AttendanceOutcome::UnknownMatch { decision } = &outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert!((decision.closest_distance - 0.05).abs() < 1e-6);
        assert_eq!(session.roster().present_count(), 0);
    }

    #[test]
    fn test_identify_embedding_unknown_identity() {
        let database = db(&[("ghost", [0.0, 0.0])]);
        let mut session = Session::new(database, roster(), MatchParams::default()).unwrap();
        let err = session.identify_embedding(&Embedding::new(vec![0.0, 0.0], None)).unwrap_err();
        assert!(matches!(err, SessionError::Ledger(LedgerError::UnknownIdentity(_))));
        // Session stays usable.
        assert_eq!(session.roster().present_count(), 0);
    }

    #[test]
    fn test_identify_image_pipeline() {
        let images = vec![
            ("ada".to_string(), solid([220, 30, 30])),
            ("ada".to_string(), solid([210, 35, 30])),
            ("alan".to_string(), solid([30, 30, 220])),
        ];
        let (database, _) =
            EnrollmentDatabase::build(images, &mut StubLocator, &mut StubEmbedder).unwrap();
        let params = MatchParams::new(3, 0.2).unwrap();
        let mut session = Session::new(database, roster(), params).unwrap();

        let outcome = session
            .identify(&solid([215, 32, 30]), &mut StubLocator, &mut StubEmbedder)
            .unwrap();
        assert!(matches!(
            outcome,
            AttendanceOutcome::Marked { ref identity_id, .. } if identity_id == "ada"
        ));

        let none = session
            .identify(&solid([0, 0, 0]), &mut StubLocator, &mut StubEmbedder)
            .unwrap();
        assert_eq!(none, AttendanceOutcome::NoFaceDetected);
    }
}
