// 🔍 Duplicate Detector - Same zone, station, filename and instant
//
// Duplicates are reported, never dropped: the second capture is still
// emitted, and the match is logged for the operator.

use crate::observation::ObservationDraft;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

// ============================================================================
// DUPLICATE MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    /// Position of the earlier observation in the batch
    pub first_index: usize,

    /// Position of the later observation in the batch
    pub duplicate_index: usize,

    /// Sheet rows, for the operator
    pub first_row: usize,
    pub duplicate_row: usize,

    /// Human-readable reason
    pub reason: String,
}

// ============================================================================
// DUPLICATE DETECTOR
// ============================================================================

type DuplicateKey = (String, String, String, i64);

/// Remembers accepted observations of one batch by their duplicate key
#[derive(Debug, Default)]
pub struct DuplicateDetector {
    /// key → (batch index, sheet row) of the first observation with that key
    seen: HashMap<DuplicateKey, (usize, usize)>,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        DuplicateDetector { seen: HashMap::new() }
    }

    /// Register `observation` as accepted at `index`, reporting a collision
    /// with an earlier one if any
    pub fn check(&mut self, index: usize, observation: &ObservationDraft) -> Option<DuplicateMatch> {
        let (zone, station, filename, millis) = observation.duplicate_key();
        let key = (zone.to_string(), station.to_string(), filename.to_string(), millis);

        match self.seen.get(&key) {
            Some(&(first_index, first_row)) => {
                let m = DuplicateMatch {
                    first_index,
                    duplicate_index: index,
                    first_row,
                    duplicate_row: observation.row,
                    reason: format!(
                        "Duplicate: {} | {} | {} at rows {} and {}",
                        observation.filename,
                        observation.station_id,
                        observation.time.to_rfc3339(),
                        first_row,
                        observation.row
                    ),
                };
                warn!(
                    first_row,
                    duplicate_row = observation.row,
                    raw = %observation.raw_line(),
                    "Duplicate observation"
                );
                Some(m)
            }
            None => {
                self.seen.insert(key, (index, observation.row));
                None
            }
        }
    }

    /// Number of distinct captures seen
    pub fn distinct(&self) -> usize {
        self.seen.len()
    }
}

/// Find all duplicates in an already assembled list
pub fn find_duplicates(observations: &[ObservationDraft]) -> Vec<DuplicateMatch> {
    let mut detector = DuplicateDetector::new();

    observations
        .iter()
        .enumerate()
        .filter_map(|(i, o)| detector.check(i, o))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn create_test_observation(row: usize, station: &str, filename: &str, second: u32) -> ObservationDraft {
        ObservationDraft {
            external_id: None,
            zone_id: "z-1".to_string(),
            station_id: station.to_string(),
            filename: filename.to_string(),
            time: Utc.with_ymd_and_hms(2020, 1, 1, 8, 0, second).unwrap(),
            species: None,
            fields: Vec::new(),
            failures: Vec::new(),
            raw_row: vec!["Zone A".to_string(), station.to_string(), filename.to_string()],
            row,
        }
    }

    #[test]
    fn test_exact_duplicate() {
        let observations = vec![
            create_test_observation(1, "s-1", "a.jpg", 0),
            create_test_observation(2, "s-1", "a.jpg", 0),
        ];

        let matches = find_duplicates(&observations);

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].first_index, 0);
        assert_eq!(matches[0].duplicate_index, 1);
        assert_eq!(matches[0].first_row, 1);
        assert_eq!(matches[0].duplicate_row, 2);
    }

    #[test]
    fn test_no_match_on_any_differing_component() {
        let observations = vec![
            create_test_observation(1, "s-1", "a.jpg", 0),
            create_test_observation(2, "s-2", "a.jpg", 0),
            create_test_observation(3, "s-1", "b.jpg", 0),
            create_test_observation(4, "s-1", "a.jpg", 1),
        ];

        assert!(find_duplicates(&observations).is_empty());
    }

    #[test]
    fn test_triplicate_points_at_first() {
        let observations = vec![
            create_test_observation(1, "s-1", "a.jpg", 0),
            create_test_observation(2, "s-1", "a.jpg", 0),
            create_test_observation(3, "s-1", "a.jpg", 0),
        ];

        let matches = find_duplicates(&observations);

        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.first_index == 0));
    }

    #[test]
    fn test_detector_counts_distinct() {
        let mut detector = DuplicateDetector::new();
        detector.check(0, &create_test_observation(1, "s-1", "a.jpg", 0));
        detector.check(1, &create_test_observation(2, "s-1", "a.jpg", 0));
        detector.check(2, &create_test_observation(3, "s-1", "c.jpg", 0));

        assert_eq!(detector.distinct(), 2);
    }
}
