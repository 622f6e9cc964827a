// Camera-Trap Import - Core Library
// Exposes all modules for use in the CLI and tests

pub mod catalog;        // Reference catalogs: zones, stations, species
pub mod config;
pub mod db;             // SQLite catalog provider + persistence gateway
pub mod deduplication;  // Duplicate detection within a batch
pub mod error;
pub mod fields;         // Column definitions + cell parsing
pub mod importer;       // Whole-sheet import
pub mod observation;
pub mod reconciliation; // Species resolution + provisional drafts
pub mod reports;        // Species counts, monthly series, observation search
pub mod resolver;       // One row → one observation draft
pub mod revisions;      // Revision ledger

// Re-export commonly used types
pub use catalog::{CatalogProvider, ProjectSpeciesLink, ReferenceCatalogs, Species, Station, Zone};
pub use config::AppConfig;
pub use db::{setup_database, CatalogSeed, Event, EventKind, SqliteStore, IMPORT_USER_ID};
pub use deduplication::{find_duplicates, DuplicateDetector, DuplicateMatch};
pub use error::{FieldError, ImportError, LedgerError, StoreError};
pub use fields::{
    convert_field_inputs, format_local_time, parse_cell, parse_local_time, ChoiceOption, ColumnDefinition,
    CustomFieldValue, FieldInput, FieldValue, SystemRole, WidgetKind,
};
pub use importer::{
    import_batch, import_csv, read_csv_rows, ImportAccumulator, ImportBatch, PersistedBatch, PersistenceGateway,
};
pub use observation::{FailureFlag, ObservationDraft, SpeciesDraft, SpeciesRef};
pub use reconciliation::{assign_species_ids, clear_new_species_flag, SpeciesAccumulator, SpeciesResolution};
pub use reports::{
    monthly_series, MonthlyMetrics, ObservationQuery, SeriesPoint, SpeciesCount, SpeciesRecords, ZoneSeries,
};
pub use resolver::{is_blank_row, resolve_row};
pub use revisions::{
    Observation, ObservationEdit, ObservationState, Revision, RevisionLedger, RevisionRecord, UserIdentity,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
