// 🧭 Row Resolver - One sheet row → one observation draft
//
// Single pass over the column definitions, in order. The zone column reads
// two cells (zone + sub-zone), so every later column is shifted by one.
// Referential problems (species) become flags; structural gaps (zone,
// station, filename, timestamp) abort the batch.

use crate::catalog::{ReferenceCatalogs, Zone};
use crate::error::ImportError;
use crate::fields::{parse_cell, parse_local_time, ColumnDefinition, CustomFieldValue, SystemRole, WidgetKind};
use crate::observation::{FailureFlag, ObservationDraft, SpeciesRef};
use crate::reconciliation::SpeciesAccumulator;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Trimmed cell text; missing cells read as empty
fn cell(cells: &[String], position: usize) -> &str {
    cells.get(position).map(|c| c.trim()).unwrap_or("")
}

/// Rows with an empty zone cell carry no observation and are skipped
pub fn is_blank_row(cells: &[String]) -> bool {
    cell(cells, 0).is_empty()
}

/// Resolve one data row.
///
/// `row` is the 1-based data row index (the header is row 0) and only used
/// for error attribution. New species drafts are appended to `species`.
pub fn resolve_row(
    row: usize,
    cells: &[String],
    columns: &[ColumnDefinition],
    catalogs: &ReferenceCatalogs,
    species: &mut SpeciesAccumulator,
    timezone_offset_minutes: i32,
) -> Result<ObservationDraft, ImportError> {
    let mut offset = 0;
    let mut zone: Option<&Zone> = None;
    let mut station_id: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut time: Option<DateTime<Utc>> = None;
    let mut species_ref: Option<SpeciesRef> = None;
    let mut fields: Vec<CustomFieldValue> = Vec::new();
    let mut unreviewed_species = false;

    for (index, column) in columns.iter().enumerate() {
        let data = cell(cells, index + offset);

        match column.system_role {
            SystemRole::Zone => {
                // Look-ahead: the next cell is the sub-zone and wins when present
                let sub_zone = cell(cells, index + offset + 1);
                zone = catalogs.find_zone(data, Some(sub_zone));
                offset += 1;
            }
            SystemRole::Station => {
                station_id = zone
                    .and_then(|z| catalogs.find_station(data, &z.id))
                    .map(|s| s.id.clone());
            }
            SystemRole::Filename => {
                filename = (!data.is_empty()).then(|| data.to_string());
            }
            SystemRole::Timestamp => match parse_local_time(data, timezone_offset_minutes) {
                Ok(t) => time = Some(t),
                Err(e) => debug!(row, column = %column.id, error = %e, "Unparseable timestamp"),
            },
            SystemRole::Species => {
                if data.is_empty() {
                    continue;
                }
                let resolution = species.resolve(data, catalogs);
                unreviewed_species |= resolution.flagged;
                debug!(row, label = data, created = resolution.created, "Species resolved");
                species_ref = Some(resolution.species);
            }
            SystemRole::None => {
                if data.is_empty() && column.widget != WidgetKind::FreeText {
                    continue;
                }
                match parse_cell(data, &column.widget, timezone_offset_minutes) {
                    Ok(value) => fields.push(CustomFieldValue {
                        column_id: column.id.clone(),
                        value,
                    }),
                    Err(e) => debug!(row, column = %column.id, error = %e, "Skipping custom cell"),
                }
            }
        }
    }

    let external_id = Some(cell(cells, columns.len() + offset))
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let mut missing = Vec::new();
    if zone.is_none() {
        missing.push("zone");
    }
    if station_id.is_none() {
        missing.push("station");
    }
    if filename.is_none() {
        missing.push("filename");
    }
    if time.is_none() {
        missing.push("timestamp");
    }

    match (zone, station_id, filename, time) {
        (Some(zone), Some(station_id), Some(filename), Some(time)) => {
            let mut draft = ObservationDraft {
                external_id,
                zone_id: zone.id.clone(),
                station_id,
                filename,
                time,
                species: species_ref,
                fields,
                failures: Vec::new(),
                raw_row: cells.to_vec(),
                row,
            };
            if unreviewed_species {
                draft.flag(FailureFlag::NewSpecies);
            }
            Ok(draft)
        }
        _ => Err(ImportError::MissingFields {
            row,
            fields: missing.into_iter().map(str::to_string).collect(),
            raw: cells.to_vec(),
        }),
    }
}

// ============================================================================
// TESTS
// ============================================================================
