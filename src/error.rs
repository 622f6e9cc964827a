//! Error taxonomy for the importer, the field parser and the revision ledger

use thiserror::Error;

/// Fatal import failure. Aborts the whole batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImportError {
    /// A row is missing zone, station, filename or a valid timestamp
    #[error("Missing required fields {} at row {row}", fields.join(", "))]
    MissingFields {
        row: usize,
        fields: Vec<String>,
        raw: Vec<String>,
    },

    /// Two rows of one sheet claim the same external observation id
    #[error("External id {external_id} at row {row} was already used at row {first_row}")]
    DuplicateExternalId {
        external_id: String,
        first_row: usize,
        row: usize,
    },
}

impl ImportError {
    /// 1-based data row index the error is attributed to
    pub fn row(&self) -> usize {
        match self {
            ImportError::MissingFields { row, .. } => *row,
            ImportError::DuplicateExternalId { row, .. } => *row,
        }
    }
}

/// Failure to convert a single cell
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("Invalid time: {0}")]
    InvalidTime(String),

    #[error("{0} is not a valid option")]
    InvalidOption(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),
}

/// Revision ledger failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// The target revision does not belong to the observation
    #[error("Revision {revision_id} not found for observation {observation_id}")]
    NotFound {
        observation_id: String,
        revision_id: String,
    },

    /// The observation has no recorded revisions yet
    #[error("No revisions recorded for observation {0}")]
    NoHistory(String),

    /// Another edit moved the current revision first
    #[error("Observation {observation_id} changed concurrently: expected current {expected:?}, found {actual:?}")]
    Conflict {
        observation_id: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Revision ledger lock poisoned")]
    LockPoisoned,
}

/// Persistence gateway / catalog provider failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored timestamp: {0}")]
    InvalidTimestamp(String),

    /// An observation references a provisional species key that is not in the batch
    #[error("Unknown provisional species: {0}")]
    UnknownProvisionalSpecies(String),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Observation not found: {0}")]
    ObservationNotFound(String),

    #[error("Species not found: {0}")]
    UnknownSpecies(String),

    #[error("Species {species_id} is not linked to project {project_id}")]
    SpeciesNotInProject { species_id: String, project_id: String },

    #[error("Zone not found: {0}")]
    UnknownZone(String),

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),
}
