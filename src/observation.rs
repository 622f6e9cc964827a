// 📷 Observation - One resolved sheet row
//
// Identity: optional external id (carried through for idempotent re-import)
// Values: zone, station, filename, time, species, custom fields
// Review state: failure flags raised during resolution

use crate::fields::CustomFieldValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// FAILURE FLAGS
// ============================================================================

/// Non-fatal, reviewable problem recorded on an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureFlag {
    /// Species is unknown, or known but not authorized for the project
    #[serde(rename = "new-species")]
    NewSpecies,
}

impl FailureFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureFlag::NewSpecies => "new-species",
        }
    }
}

// ============================================================================
// SPECIES REFERENCES
// ============================================================================

/// Species synthesized during an import. Has no id until the caller persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesDraft {
    /// Synthetic key shared by every observation of this batch that references the draft
    pub provisional_key: String,
    pub label: String,
}

impl SpeciesDraft {
    pub fn new(label: impl Into<String>) -> Self {
        SpeciesDraft {
            provisional_key: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
        }
    }
}

/// Where an observation's species lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "kebab-case")]
pub enum SpeciesRef {
    /// Persisted species id
    Catalog(String),
    /// Provisional key of a `SpeciesDraft` in the same batch
    Provisional(String),
}

impl SpeciesRef {
    pub fn persisted_id(&self) -> Option<&str> {
        match self {
            SpeciesRef::Catalog(id) => Some(id),
            SpeciesRef::Provisional(_) => None,
        }
    }
}

// ============================================================================
// OBSERVATION DRAFT
// ============================================================================

/// SHA-256 hex of the same-capture key (zone, station, filename, instant)
pub fn fingerprint(zone_id: &str, station_id: &str, filename: &str, time: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}",
        zone_id,
        station_id,
        filename,
        time.timestamp_millis()
    ));
    format!("{:x}", hasher.finalize())
}

/// Structurally complete observation produced by the importer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationDraft {
    pub external_id: Option<String>,
    pub zone_id: String,
    pub station_id: String,
    pub filename: String,
    pub time: DateTime<Utc>,
    pub species: Option<SpeciesRef>,
    pub fields: Vec<CustomFieldValue>,
    pub failures: Vec<FailureFlag>,
    /// Original cells, kept for audit and duplicate display
    pub raw_row: Vec<String>,
    /// 1-based data row index in the source sheet
    pub row: usize,
}

impl ObservationDraft {
    pub fn has_failure(&self, flag: FailureFlag) -> bool {
        self.failures.contains(&flag)
    }

    /// Add a flag once
    pub fn flag(&mut self, flag: FailureFlag) {
        if !self.has_failure(flag) {
            self.failures.push(flag);
        }
    }

    /// Remove a flag; returns whether it was present
    pub fn clear_flag(&mut self, flag: FailureFlag) -> bool {
        let before = self.failures.len();
        self.failures.retain(|f| *f != flag);
        before != self.failures.len()
    }

    /// Same-capture key: (zone, station, filename, instant)
    pub fn duplicate_key(&self) -> (&str, &str, &str, i64) {
        (
            &self.zone_id,
            &self.station_id,
            &self.filename,
            self.time.timestamp_millis(),
        )
    }

    /// SHA-256 of the duplicate key, stable across imports
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.zone_id, &self.station_id, &self.filename, self.time)
    }

    /// Raw cells joined for log output
    pub fn raw_line(&self) -> String {
        self.raw_row.join(",")
    }
}

// ============================================================================
// TESTS
// ============================================================================
