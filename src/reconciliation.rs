// ⚖️ Reconciliation Engine - One provisional species per label per batch
//
// Species labels are resolved, in order, against:
//   1. the persisted species catalog (flagged if not linked to the project)
//   2. drafts already synthesized earlier in this batch
//   3. a freshly synthesized draft
//
// The accumulator is shared state across rows: a label seen on row 2 and
// row 40 yields one draft referenced by both observations.

use crate::catalog::ReferenceCatalogs;
use crate::observation::{FailureFlag, ObservationDraft, SpeciesDraft, SpeciesRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// SPECIES RESOLUTION
// ============================================================================

/// Outcome of resolving one species label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesResolution {
    pub species: SpeciesRef,

    /// True when the observation must carry the `new-species` flag
    pub flagged: bool,

    /// True when this call synthesized the draft
    pub created: bool,
}

// ============================================================================
// SPECIES ACCUMULATOR
// ============================================================================

/// Drafts synthesized so far in one batch. Owns them until the caller persists.
#[derive(Debug, Clone, Default)]
pub struct SpeciesAccumulator {
    drafts: Vec<SpeciesDraft>,
}

impl SpeciesAccumulator {
    pub fn new() -> Self {
        SpeciesAccumulator { drafts: Vec::new() }
    }

    /// Find an already synthesized draft by exact label
    pub fn find(&self, label: &str) -> Option<&SpeciesDraft> {
        self.drafts.iter().find(|d| d.label == label)
    }

    /// Resolve a non-empty species label
    pub fn resolve(&mut self, label: &str, catalogs: &ReferenceCatalogs) -> SpeciesResolution {
        if let Some(species) = catalogs.find_species(label) {
            // Exists globally; unauthorized for the project is still reviewable
            return SpeciesResolution {
                species: SpeciesRef::Catalog(species.id.clone()),
                flagged: !catalogs.is_linked(&species.id),
                created: false,
            };
        }

        if let Some(draft) = self.find(label) {
            return SpeciesResolution {
                species: SpeciesRef::Provisional(draft.provisional_key.clone()),
                flagged: true,
                created: false,
            };
        }

        let draft = SpeciesDraft::new(label);
        let species = SpeciesRef::Provisional(draft.provisional_key.clone());
        self.drafts.push(draft);

        SpeciesResolution {
            species,
            flagged: true,
            created: true,
        }
    }

    pub fn drafts(&self) -> &[SpeciesDraft] {
        &self.drafts
    }

    pub fn into_drafts(self) -> Vec<SpeciesDraft> {
        self.drafts
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}

// ============================================================================
// POST-PERSISTENCE
// ============================================================================

/// Swap provisional species references for the ids assigned by the caller.
///
/// `assigned` maps provisional key → persisted id. References whose key is
/// missing stay provisional. Returns the number of references swapped.
pub fn assign_species_ids(observations: &mut [ObservationDraft], assigned: &HashMap<String, String>) -> usize {
    let mut swapped = 0;

    for observation in observations.iter_mut() {
        if let Some(SpeciesRef::Provisional(key)) = &observation.species {
            if let Some(id) = assigned.get(key) {
                observation.species = Some(SpeciesRef::Catalog(id.clone()));
                swapped += 1;
            }
        }
    }

    swapped
}

/// A species was linked to the project: its observations no longer need review.
///
/// Returns the number of observations whose flag was cleared.
pub fn clear_new_species_flag(observations: &mut [ObservationDraft], species_id: &str) -> usize {
    observations
        .iter_mut()
        .filter(|o| o.species.as_ref().and_then(|s| s.persisted_id()) == Some(species_id))
        .filter_map(|o| o.clear_flag(FailureFlag::NewSpecies).then_some(()))
        .count()
}

// ============================================================================
// TESTS
// ============================================================================
