// 📥 Batch Importer - Whole sheet → observations + new species, all or nothing
//
// Rows are processed strictly in order: later rows depend on the species
// drafts and accepted observations of earlier rows. The accumulator holding
// that state is threaded through the loop by value.

use crate::catalog::ReferenceCatalogs;
use crate::deduplication::{DuplicateDetector, DuplicateMatch};
use crate::error::ImportError;
use crate::fields::ColumnDefinition;
use crate::observation::{FailureFlag, ObservationDraft, SpeciesDraft};
use crate::reconciliation::{assign_species_ids, SpeciesAccumulator};
use crate::resolver::{is_blank_row, resolve_row};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

// ============================================================================
// BATCH RESULT
// ============================================================================

/// Everything one import produced. Nothing is persisted yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportBatch {
    pub observations: Vec<ObservationDraft>,
    pub new_species: Vec<SpeciesDraft>,
    pub duplicates: Vec<DuplicateMatch>,
    /// Data rows skipped because their zone cell was empty
    pub skipped_rows: Vec<usize>,
}

impl ImportBatch {
    /// Swap provisional species keys for persisted ids (provisional key → id)
    pub fn assign_species_ids(&mut self, assigned: &HashMap<String, String>) -> usize {
        assign_species_ids(&mut self.observations, assigned)
    }

    /// Observations that need manual review
    pub fn flagged(&self) -> Vec<&ObservationDraft> {
        self.observations
            .iter()
            .filter(|o| o.has_failure(FailureFlag::NewSpecies))
            .collect()
    }

    /// Each external id may address at most one row of a batch
    pub fn check_external_ids(&self) -> Result<(), ImportError> {
        let mut seen: HashMap<&str, usize> = HashMap::new();

        for observation in &self.observations {
            let Some(external_id) = observation.external_id.as_deref() else {
                continue;
            };
            if let Some(&first_row) = seen.get(external_id) {
                return Err(ImportError::DuplicateExternalId {
                    external_id: external_id.to_string(),
                    first_row,
                    row: observation.row,
                });
            }
            seen.insert(external_id, observation.row);
        }

        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} observations, {} new species, {} flagged, {} duplicates, {} skipped rows",
            self.observations.len(),
            self.new_species.len(),
            self.flagged().len(),
            self.duplicates.len(),
            self.skipped_rows.len()
        )
    }
}

// ============================================================================
// PERSISTENCE SEAM
// ============================================================================

/// Ids assigned when a batch was persisted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedBatch {
    /// provisional key → persisted species id
    pub species_ids: HashMap<String, String>,
    /// One id per observation, in batch order
    pub observation_ids: Vec<String>,
}

/// Stores an import batch atomically: new species first, then observations
pub trait PersistenceGateway {
    type Error;

    fn persist_batch(&mut self, project_id: &str, batch: &ImportBatch) -> Result<PersistedBatch, Self::Error>;
}

// ============================================================================
// ACCUMULATOR
// ============================================================================

/// Cross-row state of one import
#[derive(Debug, Default)]
pub struct ImportAccumulator {
    species: SpeciesAccumulator,
    detector: DuplicateDetector,
    observations: Vec<ObservationDraft>,
    duplicates: Vec<DuplicateMatch>,
    skipped_rows: Vec<usize>,
}

impl ImportAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve one data row and fold it into the accumulator
    pub fn process_row(
        mut self,
        row: usize,
        cells: &[String],
        columns: &[ColumnDefinition],
        catalogs: &ReferenceCatalogs,
        timezone_offset_minutes: i32,
    ) -> Result<Self, ImportError> {
        if is_blank_row(cells) {
            debug!(row, "Skipping row with empty zone");
            self.skipped_rows.push(row);
            return Ok(self);
        }

        let draft = resolve_row(row, cells, columns, catalogs, &mut self.species, timezone_offset_minutes)?;

        let index = self.observations.len();
        if let Some(duplicate) = self.detector.check(index, &draft) {
            self.duplicates.push(duplicate);
        }
        self.observations.push(draft);

        Ok(self)
    }

    pub fn finish(self) -> ImportBatch {
        ImportBatch {
            observations: self.observations,
            new_species: self.species.into_drafts(),
            duplicates: self.duplicates,
            skipped_rows: self.skipped_rows,
        }
    }
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Import a whole sheet. Row 0 is the header and is skipped.
///
/// The first structurally incomplete row aborts the import; no partial batch
/// is returned.
pub fn import_batch(
    rows: &[Vec<String>],
    columns: &[ColumnDefinition],
    catalogs: &ReferenceCatalogs,
    timezone_offset_minutes: i32,
) -> Result<ImportBatch, ImportError> {
    let batch = rows
        .iter()
        .enumerate()
        .skip(1)
        .try_fold(ImportAccumulator::new(), |acc, (row, cells)| {
            acc.process_row(row, cells, columns, catalogs, timezone_offset_minutes)
        })?
        .finish();
    batch.check_external_ids()?;

    info!(
        project = %catalogs.project_id,
        observations = batch.observations.len(),
        new_species = batch.new_species.len(),
        duplicates = batch.duplicates.len(),
        "Import batch resolved"
    );

    Ok(batch)
}

/// Read a CSV payload into raw rows (header included, ragged rows allowed)
pub fn read_csv_rows<R: Read>(reader: R) -> Result<Vec<Vec<String>>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut rows = Vec::new();
    for (line_num, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("Failed to parse CSV line {}", line_num + 1))?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(rows)
}

/// Load a CSV file and import it
pub fn import_csv(
    csv_path: &Path,
    columns: &[ColumnDefinition],
    catalogs: &ReferenceCatalogs,
    timezone_offset_minutes: i32,
) -> Result<ImportBatch> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open file: {}", csv_path.display()))?;

    let rows = read_csv_rows(file)?;
    let batch = import_batch(&rows, columns, catalogs, timezone_offset_minutes)
        .with_context(|| format!("Import of {} aborted", csv_path.display()))?;

    Ok(batch)
}

// ============================================================================
// TESTS
// ============================================================================
