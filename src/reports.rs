// 📊 Reports - Species counts, monthly time series, observation search
//
// The store runs the queries; this module holds the result shapes and the
// month bucketing, which depends on the survey's timezone offset.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Observations per species in one project (`None` = no species recorded)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesCount {
    pub species_id: Option<String>,
    pub label: Option<String>,
    pub count: usize,
}

/// Records of one species within one month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesRecords {
    pub species_id: String,
    pub label: String,
    pub records: usize,
}

/// One calendar month; species ordered by records, most first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyMetrics {
    pub year: i32,
    pub month: u32,
    pub species: Vec<SpeciesRecords>,
}

/// Monthly metrics of one zone, without gaps between its first and last month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSeries {
    pub zone_id: String,
    pub zone_label: String,
    pub metrics: Vec<MonthlyMetrics>,
}

/// One identified observation feeding the time series
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub zone_id: String,
    pub zone_label: String,
    pub species_id: String,
    pub species_label: String,
    pub time: DateTime<Utc>,
}

/// Observation search filter; empty fields do not restrict
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationQuery {
    /// Matches the zone and all of its descendants
    pub zone_id: Option<String>,
    pub station_ids: Vec<String>,
    /// Inclusive lower bound
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub end: Option<DateTime<Utc>>,
}

fn next_month((year, month): (i32, u32)) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Bucket points into per-zone monthly metrics at the given offset
pub fn monthly_series(points: &[SeriesPoint], timezone_offset_minutes: i32) -> Vec<ZoneSeries> {
    // zone id → (label, (year, month) → species id → (label, records))
    type Months = BTreeMap<(i32, u32), BTreeMap<String, (String, usize)>>;
    let mut zones: BTreeMap<String, (String, Months)> = BTreeMap::new();

    for point in points {
        let local = point.time + Duration::minutes(timezone_offset_minutes as i64);
        let month = (local.year(), local.month());

        let (_, months) = zones
            .entry(point.zone_id.clone())
            .or_insert_with(|| (point.zone_label.clone(), BTreeMap::new()));
        let (_, records) = months
            .entry(month)
            .or_default()
            .entry(point.species_id.clone())
            .or_insert_with(|| (point.species_label.clone(), 0));
        *records += 1;
    }

    zones
        .into_iter()
        .map(|(zone_id, (zone_label, months))| {
            let mut metrics: Vec<MonthlyMetrics> = Vec::new();

            for ((year, month), species) in months {
                // Months without records still appear, empty
                if let Some(last) = metrics.last() {
                    let mut gap = next_month((last.year, last.month));
                    while gap < (year, month) {
                        metrics.push(MonthlyMetrics {
                            year: gap.0,
                            month: gap.1,
                            species: Vec::new(),
                        });
                        gap = next_month(gap);
                    }
                }

                let mut species: Vec<SpeciesRecords> = species
                    .into_iter()
                    .map(|(species_id, (label, records))| SpeciesRecords {
                        species_id,
                        label,
                        records,
                    })
                    .collect();
                species.sort_by(|a, b| b.records.cmp(&a.records).then_with(|| a.label.cmp(&b.label)));

                metrics.push(MonthlyMetrics { year, month, species });
            }

            ZoneSeries {
                zone_id,
                zone_label,
                metrics,
            }
        })
        .collect()
}
