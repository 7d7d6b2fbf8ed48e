//! Attendance ledger: the roster of enrollable identities and their status.
//!
//! Statuses only move `Absent -> Present` within a session. The roster is
//! loaded from and written to CSV.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const ID_COLUMNS: [&str; 2] = ["identity_id", "id"];
const NAME_COLUMNS: [&str; 2] = ["display_name", "name"];
const STATUS_COLUMN: &str = "status";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("identity {0:?} is not in the roster")]
    UnknownIdentity(String),
    #[error("identity {0:?} appears more than once in the roster")]
    DuplicateIdentity(String),
    #[error("roster is missing a {0} column")]
    MissingColumn(&'static str),
    #[error("invalid status {value:?} for identity {identity_id:?}")]
    InvalidStatus { identity_id: String, value: String },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Absent,
    Present,
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceStatus::Absent => f.pad("Absent"),
            AttendanceStatus::Present => f.pad("Present"),
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "absent" => Ok(AttendanceStatus::Absent),
            "present" => Ok(AttendanceStatus::Present),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub identity_id: String,
    pub display_name: String,
    pub status: AttendanceStatus,
}

/// Result of a successful `mark_present`.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkReceipt {
    pub display_name: String,
    /// False when the identity was already present.
    pub newly_marked: bool,
}

/// The authoritative list of identities for a session.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Vec<IdentityEntry>,
}

impl Roster {
    /// Build a roster of absent identities from `(identity_id, display_name)` pairs.
    pub fn new<I, S>(identities: I) -> Result<Self, LedgerError>
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut roster = Roster::default();
        for (id, name) in identities {
            roster.insert(IdentityEntry {
                identity_id: id.into(),
                display_name: name.into(),
                status: AttendanceStatus::Absent,
            })?;
        }
        Ok(roster)
    }

    /// Load a roster CSV. Every identity starts `Absent`.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let roster = Self::from_reader(fs::File::open(path)?, false)?;
        tracing::info!(path = %path.display(), identities = roster.len(), "roster loaded");
        Ok(roster)
    }

    /// Load a previously saved attendance CSV, keeping its status column.
    pub fn load_attendance(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let roster = Self::from_reader(fs::File::open(path)?, true)?;
        tracing::info!(
            path = %path.display(),
            identities = roster.len(),
            present = roster.present_count(),
            "attendance loaded"
        );
        Ok(roster)
    }

    /// Parse roster CSV from any reader. With `keep_status`, a `status`
    /// column is required and honored; otherwise all entries are `Absent`.
    pub fn from_reader<R: Read>(reader: R, keep_status: bool) -> Result<Self, LedgerError> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers = csv.headers()?.clone();
        let column = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
        };

        let id_col = column(&ID_COLUMNS[..]).ok_or(LedgerError::MissingColumn("identity_id"))?;
        let name_col = column(&NAME_COLUMNS[..]).ok_or(LedgerError::MissingColumn("display_name"))?;
        let status_col = if keep_status {
            Some(column(&[STATUS_COLUMN][..]).ok_or(LedgerError::MissingColumn(STATUS_COLUMN))?)
        } else {
            None
        };

        let mut roster = Roster::default();
        for (line, record) in csv.records().enumerate() {
            let record = record?;
            let id = record.get(id_col).unwrap_or_default();
            if id.is_empty() {
                tracing::warn!(row = line + 1, "skipping roster row with blank identity id");
                continue;
            }

            let status = match status_col {
                Some(col) => {
                    let raw = record.get(col).unwrap_or_default();
                    raw.parse::<AttendanceStatus>().map_err(|()| LedgerError::InvalidStatus {
                        identity_id: id.to_string(),
                        value: raw.to_string(),
                    })?
                }
                None => AttendanceStatus::Absent,
            };

            roster.insert(IdentityEntry {
                identity_id: id.to_string(),
                display_name: record.get(name_col).unwrap_or_default().to_string(),
                status,
            })?;
        }

        Ok(roster)
    }

    fn insert(&mut self, entry: IdentityEntry) -> Result<(), LedgerError> {
        if self.get(&entry.identity_id).is_some() {
            return Err(LedgerError::DuplicateIdentity(entry.identity_id));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Write `identity_id,display_name,status` rows.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), LedgerError> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(["identity_id", "display_name", STATUS_COLUMN])?;
        for entry in &self.entries {
            let status = entry.status.to_string();
            csv.write_record([
                entry.identity_id.as_str(),
                entry.display_name.as_str(),
                status.as_str(),
            ])?;
        }
        csv.flush()?;
        Ok(())
    }

    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<(), LedgerError> {
        self.write_to(fs::File::create(path.as_ref())?)
    }

    /// Write the roster to `attendance_YYYYMMDD_HHMMSS.csv` in `dir`.
    ///
    /// Never overwrites: a numeric suffix is appended when the name is taken.
    pub fn export_timestamped(
        &self,
        dir: impl AsRef<Path>,
        now: NaiveDateTime,
    ) -> Result<PathBuf, LedgerError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let stem = format!("attendance_{}", now.format("%Y%m%d_%H%M%S"));
        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("{stem}.csv")
            } else {
                format!("{stem}_{suffix}.csv")
            };
            let path = dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    self.write_to(file)?;
                    tracing::info!(
                        path = %path.display(),
                        present = self.present_count(),
                        total = self.len(),
                        "attendance exported"
                    );
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Lookup by identity id, ignoring case (Unicode lowercase folding).
    pub fn get(&self, identity_id: &str) -> Option<&IdentityEntry> {
        self.entries
            .iter()
            .find(|e| same_identity(&e.identity_id, identity_id))
    }

    /// Mark an identity present, matching ids as `get` does. Marking an
    /// already-present identity succeeds without changing anything.
    pub fn mark_present(&mut self, identity_id: &str) -> Result<MarkReceipt, LedgerError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| same_identity(&e.identity_id, identity_id))
            .ok_or_else(|| LedgerError::UnknownIdentity(identity_id.to_string()))?;

        let newly_marked = entry.status == AttendanceStatus::Absent;
        entry.status = AttendanceStatus::Present;

        if newly_marked {
            tracing::info!(
                identity = %entry.identity_id,
                name = %entry.display_name,
                "marked present"
            );
        } else {
            tracing::debug!(identity = %entry.identity_id, "already present");
        }

        Ok(MarkReceipt {
            display_name: entry.display_name.clone(),
            newly_marked,
        })
    }

    pub fn entries(&self) -> &[IdentityEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn present_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == AttendanceStatus::Present)
            .count()
    }
}

fn same_identity(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}
