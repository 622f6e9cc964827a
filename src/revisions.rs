// ⏳ Revision Ledger - Append-only history of observation edits
//
// Identity persists, values change:
// - every edit appends a Revision holding a full snapshot of the editable fields
// - exactly one Revision per observation is current, tracked as an index
//   into the chain rather than a flag on each revision
// - rollback never rewrites history; it appends a copy of an older snapshot
//
// Each observation's chain sits behind its own mutex, so concurrent edits to
// one observation serialize while edits to different observations don't contend.

use crate::error::LedgerError;
use crate::fields::{CustomFieldValue, FieldInput};
use crate::observation::{fingerprint, FailureFlag, ObservationDraft};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

// ============================================================================
// USER IDENTITY
// ============================================================================

/// Editing user, supplied by the caller and never authenticated here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        UserIdentity {
            id: id.into(),
            name: name.into(),
            email: None,
        }
    }
}

// ============================================================================
// OBSERVATION
// ============================================================================

/// Editable fields of a persisted observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationState {
    pub zone_id: String,
    pub station_id: String,
    pub filename: String,
    pub time: DateTime<Utc>,
    pub species_id: Option<String>,
    pub fields: Vec<CustomFieldValue>,
}

impl ObservationState {
    /// Same-capture fingerprint of the current values
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.zone_id, &self.station_id, &self.filename, self.time)
    }

    /// Overwrite custom values by column id; columns not yet present are appended
    pub fn merge_fields(&mut self, values: Vec<CustomFieldValue>) {
        for value in values {
            match self.fields.iter_mut().find(|f| f.column_id == value.column_id) {
                Some(existing) => *existing = value,
                None => self.fields.push(value),
            }
        }
    }
}

/// Requested change to one observation; `None` leaves a value as it is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationEdit {
    pub species_id: Option<String>,
    pub filename: Option<String>,
    /// Raw custom values: RFC 3339 instants and option ids
    pub fields: Vec<FieldInput>,
}

/// Persisted observation as seen by the editing workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub state: ObservationState,
    pub failures: Vec<FailureFlag>,
}

impl Observation {
    /// Build from an imported draft once it has an id.
    ///
    /// Provisional species references must already be swapped for persisted
    /// ids; any left over are dropped.
    pub fn from_draft(id: impl Into<String>, draft: &ObservationDraft) -> Self {
        Observation {
            id: id.into(),
            state: ObservationState {
                zone_id: draft.zone_id.clone(),
                station_id: draft.station_id.clone(),
                filename: draft.filename.clone(),
                time: draft.time,
                species_id: draft
                    .species
                    .as_ref()
                    .and_then(|s| s.persisted_id())
                    .map(str::to_string),
                fields: draft.fields.clone(),
            },
            failures: draft.failures.clone(),
        }
    }
}

// ============================================================================
// REVISION
// ============================================================================

/// Immutable snapshot of an observation's editable fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    pub observation_id: String,
    /// Position in the chain (0 = first edit)
    pub sequence: usize,
    pub user: UserIdentity,
    pub snapshot: ObservationState,
    pub created_at: DateTime<Utc>,
}

/// Revision plus its currency, for history listings and persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    #[serde(flatten)]
    pub revision: Revision,
    pub is_current: bool,
}

/// Linear chain of revisions for one observation
#[derive(Debug, Default)]
struct RevisionChain {
    revisions: Vec<Revision>,
    current: Option<usize>,
}

impl RevisionChain {
    fn current(&self) -> Option<&Revision> {
        self.current.and_then(|i| self.revisions.get(i))
    }

    /// Append a snapshot and move the current pointer onto it
    fn append(&mut self, observation: &Observation, user: &UserIdentity) -> Revision {
        let revision = Revision {
            id: uuid::Uuid::new_v4().to_string(),
            observation_id: observation.id.clone(),
            sequence: self.revisions.len(),
            user: user.clone(),
            snapshot: observation.state.clone(),
            created_at: Utc::now(),
        };

        debug!(
            observation = %observation.id,
            previous = ?self.current().map(|r| r.id.as_str()),
            current = %revision.id,
            "Moving current revision"
        );

        self.revisions.push(revision.clone());
        self.current = Some(self.revisions.len() - 1);
        revision
    }

    fn ensure_current(&self, observation_id: &str, expected: Option<&str>) -> Result<(), LedgerError> {
        let actual = self.current().map(|r| r.id.clone());
        if actual.as_deref() != expected {
            return Err(LedgerError::Conflict {
                observation_id: observation_id.to_string(),
                expected: expected.map(str::to_string),
                actual,
            });
        }
        Ok(())
    }

    /// Apply an older snapshot to the observation and record it as current
    fn roll_back_to(
        &mut self,
        observation: &mut Observation,
        target_revision_id: &str,
        user: &UserIdentity,
    ) -> Result<Revision, LedgerError> {
        let snapshot = self
            .revisions
            .iter()
            .find(|r| r.id == target_revision_id)
            .map(|r| r.snapshot.clone())
            .ok_or_else(|| LedgerError::NotFound {
                observation_id: observation.id.clone(),
                revision_id: target_revision_id.to_string(),
            })?;

        observation.state = snapshot;
        Ok(self.append(observation, user))
    }

    fn records(&self) -> Vec<RevisionRecord> {
        self.revisions
            .iter()
            .enumerate()
            .map(|(i, r)| RevisionRecord {
                revision: r.clone(),
                is_current: self.current == Some(i),
            })
            .collect()
    }
}

// ============================================================================
// REVISION LEDGER
// ============================================================================

/// Revision chains of all observations, keyed by observation id
#[derive(Debug, Default)]
pub struct RevisionLedger {
    chains: RwLock<HashMap<String, Arc<Mutex<RevisionChain>>>>,
}

impl RevisionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, observation_id: &str) -> Result<Arc<Mutex<RevisionChain>>, LedgerError> {
        {
            let chains = self.chains.read().map_err(|_| LedgerError::LockPoisoned)?;
            if let Some(chain) = chains.get(observation_id) {
                return Ok(Arc::clone(chain));
            }
        }

        let mut chains = self.chains.write().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(Arc::clone(chains.entry(observation_id.to_string()).or_default()))
    }

    fn existing_chain(&self, observation_id: &str) -> Result<Option<Arc<Mutex<RevisionChain>>>, LedgerError> {
        let chains = self.chains.read().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(chains.get(observation_id).map(Arc::clone))
    }

    /// Snapshot the observation as the new current revision
    pub fn record_revision(&self, observation: &Observation, user: &UserIdentity) -> Result<Revision, LedgerError> {
        let chain = self.chain(&observation.id)?;
        let mut chain = chain.lock().map_err(|_| LedgerError::LockPoisoned)?;

        Ok(chain.append(observation, user))
    }

    /// Compare-and-swap variant of `record_revision`.
    ///
    /// Succeeds only if the current revision is still `expected_current`
    /// (`None` = no revision yet). Losers get `Conflict` and may reload and retry.
    pub fn record_revision_if_current(
        &self,
        observation: &Observation,
        user: &UserIdentity,
        expected_current: Option<&str>,
    ) -> Result<Revision, LedgerError> {
        let chain = self.chain(&observation.id)?;
        let mut chain = chain.lock().map_err(|_| LedgerError::LockPoisoned)?;

        chain.ensure_current(&observation.id, expected_current)?;
        Ok(chain.append(observation, user))
    }

    /// Restore the observation to a prior revision's snapshot.
    ///
    /// The rollback is itself recorded as a new current revision.
    pub fn rollback(
        &self,
        observation: &mut Observation,
        target_revision_id: &str,
        user: &UserIdentity,
    ) -> Result<Revision, LedgerError> {
        let chain = self.chain_for_rollback(&observation.id, target_revision_id)?;
        let mut chain = chain.lock().map_err(|_| LedgerError::LockPoisoned)?;

        chain.roll_back_to(observation, target_revision_id, user)
    }

    /// Compare-and-swap variant of `rollback`
    pub fn rollback_if_current(
        &self,
        observation: &mut Observation,
        target_revision_id: &str,
        user: &UserIdentity,
        expected_current: Option<&str>,
    ) -> Result<Revision, LedgerError> {
        let chain = self.chain_for_rollback(&observation.id, target_revision_id)?;
        let mut chain = chain.lock().map_err(|_| LedgerError::LockPoisoned)?;

        chain.ensure_current(&observation.id, expected_current)?;
        chain.roll_back_to(observation, target_revision_id, user)
    }

    fn chain_for_rollback(
        &self,
        observation_id: &str,
        target_revision_id: &str,
    ) -> Result<Arc<Mutex<RevisionChain>>, LedgerError> {
        self.existing_chain(observation_id)?
            .ok_or_else(|| LedgerError::NotFound {
                observation_id: observation_id.to_string(),
                revision_id: target_revision_id.to_string(),
            })
    }

    /// Current revision of an observation
    pub fn current(&self, observation_id: &str) -> Result<Revision, LedgerError> {
        let chain = self
            .existing_chain(observation_id)?
            .ok_or_else(|| LedgerError::NoHistory(observation_id.to_string()))?;
        let chain = chain.lock().map_err(|_| LedgerError::LockPoisoned)?;

        chain
            .current()
            .cloned()
            .ok_or_else(|| LedgerError::NoHistory(observation_id.to_string()))
    }

    /// Full history, oldest first
    pub fn history(&self, observation_id: &str) -> Result<Vec<RevisionRecord>, LedgerError> {
        match self.existing_chain(observation_id)? {
            Some(chain) => {
                let chain = chain.lock().map_err(|_| LedgerError::LockPoisoned)?;
                Ok(chain.records())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Rebuild a chain from persisted records (e.g. loaded from the database).
    ///
    /// Records are ordered by sequence; the last one flagged current wins,
    /// falling back to the newest.
    pub fn restore(&self, observation_id: &str, mut records: Vec<RevisionRecord>) -> Result<(), LedgerError> {
        records.sort_by_key(|r| r.revision.sequence);

        let current = records
            .iter()
            .rposition(|r| r.is_current)
            .or_else(|| records.len().checked_sub(1));

        let restored = RevisionChain {
            revisions: records.into_iter().map(|r| r.revision).collect(),
            current,
        };

        let mut chains = self.chains.write().map_err(|_| LedgerError::LockPoisoned)?;
        chains.insert(observation_id.to_string(), Arc::new(Mutex::new(restored)));
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
