use crate::catalog::{CatalogProvider, ProjectSpeciesLink, ReferenceCatalogs, Species, Station, Zone};
use crate::error::StoreError;
use crate::fields::{convert_field_inputs, ColumnDefinition, CustomFieldValue, SystemRole, WidgetKind};
use crate::importer::{ImportBatch, PersistedBatch, PersistenceGateway};
use crate::observation::{FailureFlag, SpeciesRef};
use crate::reports::{monthly_series, ObservationQuery, SeriesPoint, SpeciesCount, ZoneSeries};
use crate::revisions::{
    Observation, ObservationEdit, ObservationState, Revision, RevisionLedger, RevisionRecord, UserIdentity,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

type StoreResult<T> = Result<T, StoreError>;

/// Author of revisions written by a re-import
pub const IMPORT_USER_ID: &str = "csv-import";

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// What happened to an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ObservationImported,
    /// Same external id imported again into the same project
    ObservationReimported,
    ObservationEdited,
    ObservationRolledBack,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ObservationImported => "observation_imported",
            EventKind::ObservationReimported => "observation_reimported",
            EventKind::ObservationEdited => "observation_edited",
            EventKind::ObservationRolledBack => "observation_rolled_back",
        }
    }

    fn parse(text: &str) -> StoreResult<Self> {
        match text {
            "observation_imported" => Ok(EventKind::ObservationImported),
            "observation_reimported" => Ok(EventKind::ObservationReimported),
            "observation_edited" => Ok(EventKind::ObservationEdited),
            "observation_rolled_back" => Ok(EventKind::ObservationRolledBack),
            other => Err(StoreError::UnknownEventKind(other.to_string())),
        }
    }
}

/// Audit trail entry: every change to an observation is an event
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub observation_id: String,
    pub data: serde_json::Value,
    /// User id, or `csv-import` for imports
    pub actor: String,
}

impl Event {
    pub fn new(kind: EventKind, observation_id: &str, data: serde_json::Value, actor: &str) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            observation_id: observation_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    /// Payload shared by edit and rollback events
    fn for_revision(kind: EventKind, revision: &Revision, extra: serde_json::Value) -> Self {
        let data = serde_json::json!({
            "revision": revision.id,
            "sequence": revision.sequence,
            "user": revision.user.name,
            "filename": revision.snapshot.filename,
            "species": revision.snapshot.species_id,
            "details": extra,
        });
        Self::new(kind, &revision.observation_id, data, &revision.user.id)
    }
}

fn parse_time(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(text.to_string()))
}

pub fn setup_database(conn: &Connection) -> StoreResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Reference catalogs
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS zones (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            label TEXT NOT NULL,
            parent_id TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS stations (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            name TEXT NOT NULL,
            zone_id TEXT NOT NULL,
            UNIQUE (name, zone_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS species (
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS project_species (
            project_id TEXT NOT NULL,
            species_id TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (project_id, species_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS columns (
            id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            title TEXT NOT NULL,
            system_role TEXT NOT NULL,
            widget TEXT NOT NULL,
            PRIMARY KEY (project_id, id)
        )",
        [],
    )?;

    // ==========================================================================
    // Observations + revisions
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS observations (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            external_id TEXT,
            zone_id TEXT NOT NULL,
            station_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            time TEXT NOT NULL,
            time_ms INTEGER NOT NULL,
            species_id TEXT,
            fields TEXT NOT NULL,
            failures TEXT NOT NULL,
            raw_row TEXT NOT NULL,
            source_row INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS revisions (
            id TEXT PRIMARY KEY,
            observation_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            is_current INTEGER NOT NULL,
            user TEXT NOT NULL,
            snapshot TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (observation_id, sequence)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            observation_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    // External ids are unique per project only; NULLs never collide
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_observations_external ON observations(project_id, external_id)",
        [],
    )?;

    // Not unique: duplicates stay visible after persistence
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observations_fingerprint ON observations(project_id, fingerprint)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observations_species ON observations(project_id, species_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observations_zone_time ON observations(project_id, zone_id, time_ms)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_revisions_observation ON revisions(observation_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_observation ON events(observation_id)",
        [],
    )?;

    Ok(())
}

fn insert_event(conn: &Connection, event: &Event) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, observation_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.kind.as_str(),
            event.observation_id,
            serde_json::to_string(&event.data)?,
            event.actor,
        ],
    )?;

    Ok(())
}

// ============================================================================
// ROW HELPERS
// ============================================================================

const OBSERVATION_COLUMNS: &str = "id, project_id, zone_id, station_id, filename, time, species_id, fields, failures";

/// Raw observation columns, decoded outside the rusqlite row closure
struct ObservationRow {
    id: String,
    project_id: String,
    zone_id: String,
    station_id: String,
    filename: String,
    time: String,
    species_id: Option<String>,
    fields: String,
    failures: String,
}

impl ObservationRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(ObservationRow {
            id: row.get(0)?,
            project_id: row.get(1)?,
            zone_id: row.get(2)?,
            station_id: row.get(3)?,
            filename: row.get(4)?,
            time: row.get(5)?,
            species_id: row.get(6)?,
            fields: row.get(7)?,
            failures: row.get(8)?,
        })
    }

    /// (project id, observation)
    fn decode(self) -> StoreResult<(String, Observation)> {
        let fields: Vec<CustomFieldValue> = serde_json::from_str(&self.fields)?;
        let observation = Observation {
            id: self.id,
            state: ObservationState {
                zone_id: self.zone_id,
                station_id: self.station_id,
                filename: self.filename,
                time: parse_time(&self.time)?,
                species_id: self.species_id,
                fields,
            },
            failures: serde_json::from_str(&self.failures)?,
        };
        Ok((self.project_id, observation))
    }
}

fn read_observation(conn: &Connection, id: &str) -> StoreResult<Option<(String, Observation)>> {
    conn.query_row(
        &format!("SELECT {} FROM observations WHERE id = ?1", OBSERVATION_COLUMNS),
        params![id],
        ObservationRow::from_row,
    )
    .optional()?
    .map(ObservationRow::decode)
    .transpose()
}

/// Write back the editable fields; the fingerprint follows the new values
fn write_observation(conn: &Connection, observation: &Observation) -> StoreResult<()> {
    let state = &observation.state;
    conn.execute(
        "UPDATE observations
         SET zone_id = ?1, station_id = ?2, filename = ?3, time = ?4, time_ms = ?5,
             species_id = ?6, fields = ?7, failures = ?8, fingerprint = ?9
         WHERE id = ?10",
        params![
            state.zone_id,
            state.station_id,
            state.filename,
            state.time.to_rfc3339(),
            state.time.timestamp_millis(),
            state.species_id,
            serde_json::to_string(&state.fields)?,
            serde_json::to_string(&observation.failures)?,
            state.fingerprint(),
            observation.id,
        ],
    )?;
    Ok(())
}

fn read_columns(conn: &Connection, project_id: &str) -> StoreResult<Vec<ColumnDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, system_role, widget FROM columns
         WHERE project_id = ?1
         ORDER BY position",
    )?;

    let rows = stmt
        .query_map(params![project_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, title, role, widget)| {
            let system_role: SystemRole = serde_json::from_str(&role)?;
            let widget: WidgetKind = serde_json::from_str(&widget)?;
            Ok(ColumnDefinition::new(id, title, system_role, widget))
        })
        .collect()
}

fn write_columns(conn: &Connection, project_id: &str, columns: &[ColumnDefinition]) -> StoreResult<()> {
    conn.execute("DELETE FROM columns WHERE project_id = ?1", params![project_id])?;

    for (position, column) in columns.iter().enumerate() {
        conn.execute(
            "INSERT INTO columns (id, project_id, position, title, system_role, widget)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                column.id,
                project_id,
                position as i64,
                column.title,
                serde_json::to_string(&column.system_role)?,
                serde_json::to_string(&column.widget)?,
            ],
        )?;
    }

    Ok(())
}

fn read_revisions(conn: &Connection, observation_id: &str) -> StoreResult<Vec<RevisionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, sequence, is_current, user, snapshot, created_at
         FROM revisions
         WHERE observation_id = ?1
         ORDER BY sequence",
    )?;

    let rows = stmt
        .query_map(params![observation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, sequence, is_current, user, snapshot, created_at)| {
            let user: UserIdentity = serde_json::from_str(&user)?;
            Ok(RevisionRecord {
                revision: Revision {
                    id,
                    observation_id: observation_id.to_string(),
                    sequence: sequence as usize,
                    user,
                    snapshot: serde_json::from_str(&snapshot)?,
                    created_at: parse_time(&created_at)?,
                },
                is_current,
            })
        })
        .collect()
}

/// Rebuild the observation's chain from its persisted revisions
fn load_chain(conn: &Connection, observation_id: &str) -> StoreResult<RevisionLedger> {
    let ledger = RevisionLedger::new();
    let records = read_revisions(conn, observation_id)?;
    if !records.is_empty() {
        ledger.restore(observation_id, records)?;
    }
    Ok(ledger)
}

/// Persist a revision as the observation's only current one
fn write_revision(conn: &Connection, revision: &Revision) -> StoreResult<()> {
    conn.execute(
        "UPDATE revisions SET is_current = 0 WHERE observation_id = ?1 AND is_current = 1",
        params![revision.observation_id],
    )?;
    conn.execute(
        "INSERT INTO revisions (id, observation_id, sequence, is_current, user, snapshot, created_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
        params![
            revision.id,
            revision.observation_id,
            revision.sequence as i64,
            serde_json::to_string(&revision.user)?,
            serde_json::to_string(&revision.snapshot)?,
            revision.created_at.to_rfc3339(),
        ],
    )?;

    debug!(observation = %revision.observation_id, revision = %revision.id, "Revision persisted");
    Ok(())
}

fn species_exists(conn: &Connection, species_id: &str) -> StoreResult<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM species WHERE id = ?1)",
        params![species_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn species_linked(conn: &Connection, project_id: &str, species_id: &str) -> StoreResult<bool> {
    let linked = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM project_species WHERE project_id = ?1 AND species_id = ?2)",
        params![project_id, species_id],
        |row| row.get(0),
    )?;
    Ok(linked)
}

/// `new-species` is raised exactly when the species is not linked to the project
fn sync_species_flag(conn: &Connection, project_id: &str, observation: &mut Observation) -> StoreResult<()> {
    let unlinked = match &observation.state.species_id {
        Some(species_id) => !species_linked(conn, project_id, species_id)?,
        None => false,
    };

    observation.failures.retain(|f| *f != FailureFlag::NewSpecies);
    if unlinked {
        observation.failures.push(FailureFlag::NewSpecies);
    }
    Ok(())
}

/// Catalog content for one project, as loaded from a JSON seed file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSeed {
    pub zones: Vec<Zone>,
    pub stations: Vec<Station>,
    pub species: Vec<Species>,
    /// Species ids authorized for the project, in display order
    pub project_species: Vec<String>,
    pub columns: Vec<ColumnDefinition>,
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// SQLite-backed catalog provider and persistence gateway
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (and initialize) a database file
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        // Concurrent editors wait for the write lock instead of failing
        conn.busy_timeout(Duration::from_secs(5))?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    // ------------------------------------------------------------------------
    // Catalog maintenance
    // ------------------------------------------------------------------------

    pub fn insert_zone(&self, project_id: &str, zone: &Zone) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO zones (id, project_id, label, parent_id) VALUES (?1, ?2, ?3, ?4)",
            params![zone.id, project_id, zone.label, zone.parent_id],
        )?;
        Ok(())
    }

    pub fn insert_station(&self, project_id: &str, station: &Station) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO stations (id, project_id, name, zone_id) VALUES (?1, ?2, ?3, ?4)",
            params![station.id, project_id, station.name, station.zone_id],
        )?;
        Ok(())
    }

    pub fn insert_species(&self, species: &Species) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO species (id, label) VALUES (?1, ?2)",
            params![species.id, species.label],
        )?;
        Ok(())
    }

    /// Replace the column layout of a project
    pub fn save_columns(&mut self, project_id: &str, columns: &[ColumnDefinition]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        write_columns(&tx, project_id, columns)?;
        tx.commit()?;
        Ok(())
    }

    /// Load a whole catalog seed for a project in one transaction.
    ///
    /// Existing rows with the same ids are replaced; the column layout is
    /// replaced only when the seed defines one.
    pub fn seed_catalog(&mut self, project_id: &str, seed: &CatalogSeed) -> StoreResult<()> {
        let tx = self.conn.transaction()?;

        for zone in &seed.zones {
            tx.execute(
                "INSERT OR REPLACE INTO zones (id, project_id, label, parent_id) VALUES (?1, ?2, ?3, ?4)",
                params![zone.id, project_id, zone.label, zone.parent_id],
            )?;
        }
        for station in &seed.stations {
            tx.execute(
                "INSERT OR REPLACE INTO stations (id, project_id, name, zone_id) VALUES (?1, ?2, ?3, ?4)",
                params![station.id, project_id, station.name, station.zone_id],
            )?;
        }
        for species in &seed.species {
            tx.execute(
                "INSERT OR REPLACE INTO species (id, label) VALUES (?1, ?2)",
                params![species.id, species.label],
            )?;
        }
        for (position, species_id) in seed.project_species.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO project_species (project_id, species_id, position) VALUES (?1, ?2, ?3)",
                params![project_id, species_id, position as i64],
            )?;
        }
        if !seed.columns.is_empty() {
            write_columns(&tx, project_id, &seed.columns)?;
        }

        tx.commit()?;
        info!(
            project = project_id,
            zones = seed.zones.len(),
            stations = seed.stations.len(),
            species = seed.species.len(),
            columns = seed.columns.len(),
            "Catalog seeded"
        );
        Ok(())
    }

    /// Column layout of a project, in sheet order
    pub fn load_columns(&self, project_id: &str) -> StoreResult<Vec<ColumnDefinition>> {
        read_columns(&self.conn, project_id)
    }

    /// Authorize a species for a project and clear the `new-species` flag on
    /// the project's observations that reference it.
    ///
    /// Returns the number of observations whose flag was cleared.
    pub fn link_project_species(&mut self, project_id: &str, species_id: &str) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;

        let position: i64 = tx.query_row(
            "SELECT COUNT(*) FROM project_species WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO project_species (project_id, species_id, position) VALUES (?1, ?2, ?3)",
            params![project_id, species_id, position],
        )?;

        let flagged: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, failures FROM observations WHERE project_id = ?1 AND species_id = ?2",
            )?;
            let rows = stmt
                .query_map(params![project_id, species_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut cleared = 0;
        for (id, failures_json) in flagged {
            let mut failures: Vec<FailureFlag> = serde_json::from_str(&failures_json)?;
            let before = failures.len();
            failures.retain(|f| *f != FailureFlag::NewSpecies);
            if failures.len() != before {
                tx.execute(
                    "UPDATE observations SET failures = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&failures)?, id],
                )?;
                cleared += 1;
            }
        }

        tx.commit()?;
        info!(project = project_id, species = species_id, cleared, "Species linked to project");
        Ok(cleared)
    }

    // ------------------------------------------------------------------------
    // Observations
    // ------------------------------------------------------------------------

    pub fn load_observation(&self, id: &str) -> StoreResult<Option<Observation>> {
        Ok(read_observation(&self.conn, id)?.map(|(_, observation)| observation))
    }

    /// Internal id of the observation imported under `external_id`
    pub fn observation_id_for_external(&self, project_id: &str, external_id: &str) -> StoreResult<Option<String>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM observations WHERE project_id = ?1 AND external_id = ?2",
                params![project_id, external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn count_observations(&self, project_id: &str) -> StoreResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM observations WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Observations beyond the first for each (zone, station, filename, time)
    pub fn count_duplicates(&self, project_id: &str) -> StoreResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) - COUNT(DISTINCT fingerprint) FROM observations WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Audit trail of one observation, oldest first
    pub fn observation_events(&self, observation_id: &str) -> StoreResult<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, data, actor
             FROM events
             WHERE observation_id = ?1
             ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![observation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(event_id, timestamp, event_type, data, actor)| {
                Ok(Event {
                    event_id,
                    timestamp: parse_time(&timestamp)?,
                    kind: EventKind::parse(&event_type)?,
                    observation_id: observation_id.to_string(),
                    data: serde_json::from_str(&data)?,
                    actor,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Revisions
    // ------------------------------------------------------------------------

    /// All revisions of an observation, oldest first
    pub fn get_revisions_for_observation(&self, observation_id: &str) -> StoreResult<Vec<RevisionRecord>> {
        read_revisions(&self.conn, observation_id)
    }

    /// Id of the current revision; `None` before the first edit
    pub fn current_revision_id(&self, observation_id: &str) -> StoreResult<Option<String>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM revisions WHERE observation_id = ?1 AND is_current = 1",
                params![observation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Edit an observation and record the result as its new current revision.
    ///
    /// `expected_current` is the revision the editor loaded (`None` = none
    /// yet). The check, the observation update and the revision insert share
    /// one write transaction, so of two editors that loaded the same revision
    /// exactly one succeeds and the other gets `LedgerError::Conflict`.
    pub fn apply_edit(
        &mut self,
        observation_id: &str,
        edit: &ObservationEdit,
        user: &UserIdentity,
        expected_current: Option<&str>,
    ) -> StoreResult<Revision> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (project_id, mut observation) = read_observation(&tx, observation_id)?
            .ok_or_else(|| StoreError::ObservationNotFound(observation_id.to_string()))?;

        if let Some(species_id) = &edit.species_id {
            if !species_exists(&tx, species_id)? {
                return Err(StoreError::UnknownSpecies(species_id.clone()));
            }
            if !species_linked(&tx, &project_id, species_id)? {
                return Err(StoreError::SpeciesNotInProject {
                    species_id: species_id.clone(),
                    project_id,
                });
            }
            observation.state.species_id = Some(species_id.clone());
        }

        if let Some(filename) = &edit.filename {
            let filename = filename.trim();
            if filename.is_empty() {
                return Err(StoreError::InvalidEdit("filename must not be empty".to_string()));
            }
            observation.state.filename = filename.to_string();
        }

        if !edit.fields.is_empty() {
            let columns = read_columns(&tx, &project_id)?;
            observation.state.merge_fields(convert_field_inputs(&edit.fields, &columns)?);
        }

        sync_species_flag(&tx, &project_id, &mut observation)?;

        let ledger = load_chain(&tx, observation_id)?;
        let revision = ledger.record_revision_if_current(&observation, user, expected_current)?;

        write_observation(&tx, &observation)?;
        write_revision(&tx, &revision)?;
        let changed: Vec<&str> = edit.fields.iter().map(|f| f.column_id.as_str()).collect();
        insert_event(
            &tx,
            &Event::for_revision(EventKind::ObservationEdited, &revision, serde_json::json!({ "fields": changed })),
        )?;

        tx.commit()?;
        info!(observation = observation_id, revision = %revision.id, user = %user.id, "Observation edited");
        Ok(revision)
    }

    /// Restore an observation to an earlier revision's snapshot.
    ///
    /// Same concurrency contract as `apply_edit`. The rollback itself becomes
    /// the new current revision; the `new-species` flag is re-derived for the
    /// restored species.
    pub fn apply_rollback(
        &mut self,
        observation_id: &str,
        target_revision_id: &str,
        user: &UserIdentity,
        expected_current: Option<&str>,
    ) -> StoreResult<Revision> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (project_id, mut observation) = read_observation(&tx, observation_id)?
            .ok_or_else(|| StoreError::ObservationNotFound(observation_id.to_string()))?;

        let ledger = load_chain(&tx, observation_id)?;
        let revision = ledger.rollback_if_current(&mut observation, target_revision_id, user, expected_current)?;
        sync_species_flag(&tx, &project_id, &mut observation)?;

        write_observation(&tx, &observation)?;
        write_revision(&tx, &revision)?;
        insert_event(
            &tx,
            &Event::for_revision(
                EventKind::ObservationRolledBack,
                &revision,
                serde_json::json!({ "target": target_revision_id }),
            ),
        )?;

        tx.commit()?;
        info!(observation = observation_id, target = target_revision_id, user = %user.id, "Observation rolled back");
        Ok(revision)
    }

    // ------------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------------

    /// Observations per species, most frequent first
    pub fn species_counts(&self, project_id: &str) -> StoreResult<Vec<SpeciesCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT o.species_id, s.label, COUNT(*) AS n
             FROM observations o
             LEFT JOIN species s ON s.id = o.species_id
             WHERE o.project_id = ?1
             GROUP BY o.species_id
             ORDER BY n DESC, s.label",
        )?;

        let counts = stmt
            .query_map(params![project_id], |row| {
                Ok(SpeciesCount {
                    species_id: row.get(0)?,
                    label: row.get(1)?,
                    count: row.get::<_, i64>(2)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Monthly records per species for each zone, months taken at the offset
    pub fn species_time_series(&self, project_id: &str, timezone_offset_minutes: i32) -> StoreResult<Vec<ZoneSeries>> {
        let mut stmt = self.conn.prepare(
            "SELECT o.zone_id, z.label, o.species_id, s.label, o.time
             FROM observations o
             JOIN zones z ON z.id = o.zone_id
             JOIN species s ON s.id = o.species_id
             WHERE o.project_id = ?1",
        )?;

        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let points = rows
            .into_iter()
            .map(|(zone_id, zone_label, species_id, species_label, time)| {
                Ok(SeriesPoint {
                    zone_id,
                    zone_label,
                    species_id,
                    species_label,
                    time: parse_time(&time)?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(monthly_series(&points, timezone_offset_minutes))
    }

    /// Observations of a project matching the query, in time order
    pub fn find_observations(&self, project_id: &str, query: &ObservationQuery) -> StoreResult<Vec<Observation>> {
        if let Some(zone_id) = &query.zone_id {
            let known: bool = self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM zones WHERE id = ?1 AND project_id = ?2)",
                params![zone_id, project_id],
                |row| row.get(0),
            )?;
            if !known {
                return Err(StoreError::UnknownZone(zone_id.clone()));
            }
        }

        let mut stmt = self.conn.prepare(&format!(
            "WITH RECURSIVE scope(id) AS (
                SELECT id FROM zones WHERE id = ?2
                UNION
                SELECT z.id FROM zones z JOIN scope ON z.parent_id = scope.id
            )
            SELECT {} FROM observations
            WHERE project_id = ?1
              AND (?2 IS NULL OR zone_id IN (SELECT id FROM scope))
              AND (?3 IS NULL OR time_ms >= ?3)
              AND (?4 IS NULL OR time_ms <= ?4)
            ORDER BY time_ms, id",
            OBSERVATION_COLUMNS
        ))?;

        let rows = stmt
            .query_map(
                params![
                    project_id,
                    query.zone_id.as_deref(),
                    query.start.map(|t| t.timestamp_millis()),
                    query.end.map(|t| t.timestamp_millis()),
                ],
                ObservationRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut observations = Vec::with_capacity(rows.len());
        for row in rows {
            let (_, observation) = row.decode()?;
            if query.station_ids.is_empty() || query.station_ids.contains(&observation.state.station_id) {
                observations.push(observation);
            }
        }
        Ok(observations)
    }
}

// ============================================================================
// CATALOG PROVIDER
// ============================================================================

impl CatalogProvider for SqliteStore {
    type Error = StoreError;

    fn load_catalogs(&self, project_id: &str) -> StoreResult<ReferenceCatalogs> {
        let zones = self
            .conn
            .prepare("SELECT id, label, parent_id FROM zones WHERE project_id = ?1 ORDER BY rowid")?
            .query_map(params![project_id], |row| {
                Ok(Zone {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    parent_id: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let stations = self
            .conn
            .prepare("SELECT id, name, zone_id FROM stations WHERE project_id = ?1 ORDER BY rowid")?
            .query_map(params![project_id], |row| {
                Ok(Station {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    zone_id: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let species = self
            .conn
            .prepare("SELECT id, label FROM species ORDER BY label")?
            .query_map([], |row| {
                Ok(Species {
                    id: row.get(0)?,
                    label: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let project_species = self
            .conn
            .prepare("SELECT species_id FROM project_species WHERE project_id = ?1 ORDER BY position")?
            .query_map(params![project_id], |row| {
                Ok(ProjectSpeciesLink {
                    project_id: project_id.to_string(),
                    species_id: row.get(0)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ReferenceCatalogs {
            project_id: project_id.to_string(),
            zones,
            stations,
            species,
            project_species,
        })
    }
}

// ============================================================================
// PERSISTENCE GATEWAY
// ============================================================================

impl PersistenceGateway for SqliteStore {
    type Error = StoreError;

    /// Persist new species and observations in one transaction.
    ///
    /// An external id addresses at most one observation per project. A row
    /// whose external id is already stored in the project updates that
    /// observation in place; if it has a revision chain, the re-imported
    /// values are appended as its new current revision, authored by
    /// `csv-import`.
    fn persist_batch(&mut self, project_id: &str, batch: &ImportBatch) -> StoreResult<PersistedBatch> {
        batch.check_external_ids()?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let importer = UserIdentity::new(IMPORT_USER_ID, "CSV import");

        let mut species_ids = HashMap::new();
        for draft in &batch.new_species {
            let id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO species (id, label) VALUES (?1, ?2)",
                params![id, draft.label],
            )?;
            species_ids.insert(draft.provisional_key.clone(), id);
        }

        let mut observation_ids = Vec::with_capacity(batch.observations.len());
        for draft in &batch.observations {
            let species_id = match &draft.species {
                Some(SpeciesRef::Catalog(id)) => Some(id.clone()),
                Some(SpeciesRef::Provisional(key)) => Some(
                    species_ids
                        .get(key)
                        .cloned()
                        .ok_or_else(|| StoreError::UnknownProvisionalSpecies(key.clone()))?,
                ),
                None => None,
            };

            let mut observation = Observation::from_draft(uuid::Uuid::new_v4().to_string(), draft);
            observation.state.species_id = species_id;

            let stored_id: String = tx.query_row(
                "INSERT INTO observations (
                    id, project_id, external_id, zone_id, station_id, filename, time, time_ms,
                    species_id, fields, failures, raw_row, source_row, fingerprint
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ON CONFLICT (project_id, external_id) DO UPDATE SET
                    zone_id = excluded.zone_id,
                    station_id = excluded.station_id,
                    filename = excluded.filename,
                    time = excluded.time,
                    time_ms = excluded.time_ms,
                    species_id = excluded.species_id,
                    fields = excluded.fields,
                    failures = excluded.failures,
                    raw_row = excluded.raw_row,
                    source_row = excluded.source_row,
                    fingerprint = excluded.fingerprint
                RETURNING id",
                params![
                    observation.id,
                    project_id,
                    draft.external_id,
                    observation.state.zone_id,
                    observation.state.station_id,
                    observation.state.filename,
                    observation.state.time.to_rfc3339(),
                    observation.state.time.timestamp_millis(),
                    observation.state.species_id,
                    serde_json::to_string(&observation.state.fields)?,
                    serde_json::to_string(&observation.failures)?,
                    serde_json::to_string(&draft.raw_row)?,
                    draft.row as i64,
                    observation.state.fingerprint(),
                ],
                |row| row.get(0),
            )?;

            let kind = if stored_id == observation.id {
                EventKind::ObservationImported
            } else {
                observation.id = stored_id;
                let ledger = load_chain(&tx, &observation.id)?;
                if ledger.current(&observation.id).is_ok() {
                    let revision = ledger.record_revision(&observation, &importer)?;
                    write_revision(&tx, &revision)?;
                }
                EventKind::ObservationReimported
            };

            let event = Event::new(
                kind,
                &observation.id,
                serde_json::json!({
                    "project": project_id,
                    "external_id": draft.external_id,
                    "row": draft.row,
                    "filename": draft.filename,
                    "failures": draft.failures,
                }),
                IMPORT_USER_ID,
            );
            insert_event(&tx, &event)?;

            observation_ids.push(observation.id);
        }

        tx.commit()?;
        info!(
            project = project_id,
            observations = observation_ids.len(),
            new_species = species_ids.len(),
            "Import batch persisted"
        );

        Ok(PersistedBatch {
            species_ids,
            observation_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FieldError, ImportError, LedgerError};
    use crate::fields::{ChoiceOption, FieldInput, FieldValue};
    use crate::importer::import_batch;
    use chrono::TimeZone;

    const PROJECT: &str = "project-1";

    fn seed_test_catalog(store: &mut SqliteStore) {
        store.insert_zone(PROJECT, &Zone::new("z-a", "Zone A")).unwrap();
        store.insert_zone(PROJECT, &Zone::new("z-a1", "Sub 1").with_parent("z-a")).unwrap();
        store.insert_zone(PROJECT, &Zone::new("z-b", "Zone B")).unwrap();
        store.insert_zone("project-2", &Zone::new("z-x", "Zone A")).unwrap();
        store.insert_station(PROJECT, &Station::new("s-1", "Station 1", "z-a")).unwrap();
        store.insert_station(PROJECT, &Station::new("s-2", "Station 2", "z-a")).unwrap();
        store.insert_station(PROJECT, &Station::new("s-a1", "Station 1", "z-a1")).unwrap();
        store.insert_station(PROJECT, &Station::new("s-b1", "Station 1", "z-b")).unwrap();
        store.insert_species(&Species::new("sp-deer", "Deer")).unwrap();
        store.insert_species(&Species::new("sp-boar", "Boar")).unwrap();
        store.link_project_species(PROJECT, "sp-deer").unwrap();

        store.save_columns(PROJECT, &test_columns()).unwrap();
    }

    fn test_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::system("c-zone", "Zone", SystemRole::Zone),
            ColumnDefinition::system("c-station", "Station", SystemRole::Station),
            ColumnDefinition::system("c-file", "Filename", SystemRole::Filename),
            ColumnDefinition::system("c-time", "Time", SystemRole::Timestamp),
            ColumnDefinition::system("c-species", "Species", SystemRole::Species),
            ColumnDefinition::new(
                "c-weather",
                "Weather",
                SystemRole::None,
                WidgetKind::EnumeratedChoice {
                    options: vec![ChoiceOption::new("o-sun", "Sunny"), ChoiceOption::new("o-rain", "Rain")],
                },
            ),
        ]
    }

    fn create_test_store() -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().unwrap();
        seed_test_catalog(&mut store);
        store
    }

    fn sheet(rows: &[&[&str]]) -> Vec<Vec<String>> {
        let header: &[&str] = &["Zone", "Sub", "Station", "File", "Time", "Species", "Weather", "Id"];
        std::iter::once(header)
            .chain(rows.iter().copied())
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn import_rows(store: &mut SqliteStore, project_id: &str, rows: &[&[&str]]) -> PersistedBatch {
        let columns = store.load_columns(project_id).unwrap();
        let catalogs = store.load_catalogs(project_id).unwrap();
        let batch = import_batch(&sheet(rows), &columns, &catalogs, 480).unwrap();
        store.persist_batch(project_id, &batch).unwrap()
    }

    fn external(store: &SqliteStore, external_id: &str) -> String {
        store.observation_id_for_external(PROJECT, external_id).unwrap().unwrap()
    }

    fn editor() -> UserIdentity {
        UserIdentity::new("user-1", "Field Tech")
    }

    fn rename(filename: &str) -> ObservationEdit {
        ObservationEdit {
            filename: Some(filename.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_catalogs_are_scoped_to_project() {
        let store = create_test_store();

        let catalogs = store.load_catalogs(PROJECT).unwrap();

        assert_eq!(catalogs.zones.len(), 3);
        assert_eq!(catalogs.stations.len(), 4);
        assert_eq!(catalogs.species.len(), 2);
        assert!(catalogs.is_linked("sp-deer"));
        assert!(!catalogs.is_linked("sp-boar"));
        assert_eq!(catalogs.find_zone("Zone A", Some("Sub 1")).unwrap().id, "z-a1");
    }

    #[test]
    fn test_columns_round_trip_in_order() {
        let store = create_test_store();

        let columns = store.load_columns(PROJECT).unwrap();

        assert_eq!(columns.len(), 6);
        assert_eq!(columns[0].system_role, SystemRole::Zone);
        assert_eq!(columns[3].widget, WidgetKind::Timestamp);
        assert!(matches!(columns[5].widget, WidgetKind::EnumeratedChoice { .. }));
    }

    #[test]
    fn test_seed_catalog_from_json() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let seed: CatalogSeed = serde_json::from_str(
            r#"{
                "zones": [{"id": "z-n", "label": "North"}],
                "stations": [{"id": "s-n1", "name": "N1", "zone_id": "z-n"}],
                "species": [{"id": "sp-1", "label": "Deer"}],
                "project_species": ["sp-1"],
                "columns": [
                    {"id": "c-zone", "title": "Zone", "system_role": "zone", "widget": {"widget": "free-text"}},
                    {"id": "c-time", "title": "Time", "system_role": "timestamp", "widget": {"widget": "timestamp"}}
                ]
            }"#,
        )
        .unwrap();

        store.seed_catalog(PROJECT, &seed).unwrap();
        // Seeding twice replaces rather than failing
        store.seed_catalog(PROJECT, &seed).unwrap();

        let catalogs = store.load_catalogs(PROJECT).unwrap();
        assert_eq!(catalogs.find_zone("North", None).unwrap().id, "z-n");
        assert_eq!(catalogs.find_station("N1", "z-n").unwrap().id, "s-n1");
        assert!(catalogs.is_linked("sp-1"));
        assert_eq!(store.load_columns(PROJECT).unwrap().len(), 2);
    }

    #[test]
    fn test_persist_batch_assigns_species_ids() {
        let mut store = create_test_store();
        let columns = store.load_columns(PROJECT).unwrap();
        let catalogs = store.load_catalogs(PROJECT).unwrap();
        let rows = sheet(&[
            &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "Civet", "Sunny", "obs-1"],
            &["Zone A", "", "Station 1", "2.jpg", "2020-01-01 08:01:00", "Civet", "", ""],
            &["Zone A", "", "Station 1", "2.jpg", "2020-01-01 08:01:00", "Deer", "", ""],
        ]);

        let mut batch = import_batch(&rows, &columns, &catalogs, 480).unwrap();
        let persisted = store.persist_batch(PROJECT, &batch).unwrap();

        assert_eq!(persisted.observation_ids.len(), 3);
        assert_eq!(persisted.observation_ids[0], external(&store, "obs-1"));
        assert_eq!(persisted.species_ids.len(), 1);
        assert_eq!(store.count_observations(PROJECT).unwrap(), 3);
        assert_eq!(store.count_duplicates(PROJECT).unwrap(), 1);

        assert_eq!(batch.assign_species_ids(&persisted.species_ids), 2);
        let civet_id = persisted.species_ids.values().next().unwrap().clone();
        let stored = store.load_observation(&persisted.observation_ids[0]).unwrap().unwrap();
        assert_eq!(stored.state.species_id, Some(civet_id.clone()));
        assert_eq!(stored.failures, vec![FailureFlag::NewSpecies]);
        assert_eq!(stored.state.fields.len(), 1);

        // The new species is now in the catalog
        let catalogs = store.load_catalogs(PROJECT).unwrap();
        assert_eq!(catalogs.find_species("Civet").unwrap().id, civet_id);

        let events = store.observation_events(&persisted.observation_ids[0]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ObservationImported);
        assert_eq!(events[0].actor, IMPORT_USER_ID);
    }

    #[test]
    fn test_reimport_with_external_id_updates_in_place() {
        let mut store = create_test_store();
        let row: &[&str] = &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "Deer", "", "obs-1"];

        let first = import_rows(&mut store, PROJECT, &[row]);
        let second = import_rows(&mut store, PROJECT, &[row]);

        assert_eq!(store.count_observations(PROJECT).unwrap(), 1);
        assert_eq!(first.observation_ids, second.observation_ids);

        let events = store.observation_events(&first.observation_ids[0]).unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::ObservationImported, EventKind::ObservationReimported]);
    }

    #[test]
    fn test_repeated_external_id_in_one_batch_is_rejected() {
        let mut store = create_test_store();
        let columns = store.load_columns(PROJECT).unwrap();
        let catalogs = store.load_catalogs(PROJECT).unwrap();
        let rows = sheet(&[
            &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "", "", "obs-1"],
            &["Zone A", "", "Station 2", "2.jpg", "2020-01-01 08:05:00", "", "", "obs-2"],
        ]);
        let mut batch = import_batch(&rows, &columns, &catalogs, 480).unwrap();
        batch.observations[1].external_id = Some("obs-1".to_string());

        let err = store.persist_batch(PROJECT, &batch).unwrap_err();

        assert!(matches!(
            err,
            StoreError::Import(ImportError::DuplicateExternalId { first_row: 1, row: 2, .. })
        ));
        assert_eq!(store.count_observations(PROJECT).unwrap(), 0);
    }

    #[test]
    fn test_external_ids_are_scoped_per_project() {
        let mut store = create_test_store();
        let seed = CatalogSeed {
            stations: vec![Station::new("s-x1", "Station 1", "z-x")],
            columns: test_columns(),
            ..Default::default()
        };
        store.seed_catalog("project-2", &seed).unwrap();
        let row: &[&str] = &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "", "", "obs-1"];

        let first = import_rows(&mut store, PROJECT, &[row]);
        let second = import_rows(&mut store, "project-2", &[row]);

        assert_eq!(store.count_observations(PROJECT).unwrap(), 1);
        assert_eq!(store.count_observations("project-2").unwrap(), 1);
        assert_ne!(first.observation_ids, second.observation_ids);
        let stored = store.load_observation(&first.observation_ids[0]).unwrap().unwrap();
        assert_eq!(stored.state.station_id, "s-1");
    }

    #[test]
    fn test_reimport_of_edited_observation_extends_its_history() {
        let mut store = create_test_store();
        let row: &[&str] = &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "Deer", "", "obs-1"];
        import_rows(&mut store, PROJECT, &[row]);
        let id = external(&store, "obs-1");

        let edited = store.apply_edit(&id, &rename("renamed.jpg"), &editor(), None).unwrap();
        import_rows(&mut store, PROJECT, &[row]);

        let records = store.get_revisions_for_observation(&id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].revision.id, edited.id);
        assert!(records[1].is_current);
        assert_eq!(records[1].revision.user.id, IMPORT_USER_ID);
        assert_eq!(records[1].revision.snapshot.filename, "1.jpg");
        assert_eq!(store.load_observation(&id).unwrap().unwrap().state.filename, "1.jpg");
    }

    #[test]
    fn test_link_species_clears_flags() {
        let mut store = create_test_store();
        import_rows(
            &mut store,
            PROJECT,
            &[
                &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "Boar", "", "obs-1"],
                &["Zone A", "", "Station 1", "2.jpg", "2020-01-01 08:05:00", "Deer", "", "obs-2"],
            ],
        );

        assert_eq!(store.link_project_species(PROJECT, "sp-boar").unwrap(), 1);
        let id = external(&store, "obs-1");
        assert!(store.load_observation(&id).unwrap().unwrap().failures.is_empty());
        assert!(store.load_catalogs(PROJECT).unwrap().is_linked("sp-boar"));

        // Linking again is harmless
        assert_eq!(store.link_project_species(PROJECT, "sp-boar").unwrap(), 0);
    }

    #[test]
    fn test_edit_writes_observation_revision_and_event_together() {
        let mut store = create_test_store();
        import_rows(
            &mut store,
            PROJECT,
            &[&["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "Deer", "", "obs-1"]],
        );
        let id = external(&store, "obs-1");

        let edit = ObservationEdit {
            filename: Some("1-fixed.jpg".to_string()),
            fields: vec![FieldInput::new("c-weather", "o-rain")],
            ..Default::default()
        };
        let revision = store.apply_edit(&id, &edit, &editor(), None).unwrap();

        let stored = store.load_observation(&id).unwrap().unwrap();
        assert_eq!(stored.state, revision.snapshot);
        assert_eq!(stored.state.filename, "1-fixed.jpg");
        assert_eq!(
            stored.state.fields[0].value,
            FieldValue::Choice(ChoiceOption::new("o-rain", "Rain"))
        );
        assert_eq!(store.current_revision_id(&id).unwrap(), Some(revision.id.clone()));

        let events = store.observation_events(&id).unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::ObservationEdited);
        assert_eq!(events.last().unwrap().actor, "user-1");
        assert_eq!(events.last().unwrap().data["revision"], revision.id.as_str());
    }

    #[test]
    fn test_stale_editor_on_second_connection_loses_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey.db");
        let mut first = SqliteStore::open(&path).unwrap();
        seed_test_catalog(&mut first);
        import_rows(
            &mut first,
            PROJECT,
            &[&["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "Deer", "", "obs-1"]],
        );
        let mut second = SqliteStore::open(&path).unwrap();
        let id = external(&first, "obs-1");

        // Both editors load the same state
        let seen_by_first = first.current_revision_id(&id).unwrap();
        let seen_by_second = second.current_revision_id(&id).unwrap();

        first
            .apply_edit(&id, &rename("A.jpg"), &editor(), seen_by_first.as_deref())
            .unwrap();
        let err = second
            .apply_edit(&id, &rename("B.jpg"), &UserIdentity::new("user-2", "Other"), seen_by_second.as_deref())
            .unwrap_err();

        assert!(matches!(err, StoreError::Ledger(LedgerError::Conflict { .. })));
        let stored = second.load_observation(&id).unwrap().unwrap();
        assert_eq!(stored.state.filename, "A.jpg");
        let records = second.get_revisions_for_observation(&id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].revision.snapshot.filename, "A.jpg");

        // Reloading and retrying succeeds
        let current = second.current_revision_id(&id).unwrap();
        second
            .apply_edit(&id, &rename("B.jpg"), &UserIdentity::new("user-2", "Other"), current.as_deref())
            .unwrap();
        assert_eq!(first.load_observation(&id).unwrap().unwrap().state.filename, "B.jpg");
    }

    #[test]
    fn test_edit_refreshes_fingerprint() {
        let mut store = create_test_store();
        import_rows(
            &mut store,
            PROJECT,
            &[
                &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "", "", "obs-1"],
                &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "", "", "obs-2"],
            ],
        );
        assert_eq!(store.count_duplicates(PROJECT).unwrap(), 1);

        let id = external(&store, "obs-2");
        let renamed = store.apply_edit(&id, &rename("2.jpg"), &editor(), None).unwrap();
        assert_eq!(store.count_duplicates(PROJECT).unwrap(), 0);

        // Rolling back to a duplicate state makes it a duplicate again
        let first = store.apply_edit(&id, &rename("1.jpg"), &editor(), Some(&renamed.id)).unwrap();
        assert_eq!(store.count_duplicates(PROJECT).unwrap(), 1);
        store.apply_rollback(&id, &renamed.id, &editor(), Some(&first.id)).unwrap();
        assert_eq!(store.count_duplicates(PROJECT).unwrap(), 0);
    }

    #[test]
    fn test_edit_validates_species() {
        let mut store = create_test_store();
        import_rows(
            &mut store,
            PROJECT,
            &[&["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "Boar", "", "obs-1"]],
        );
        let id = external(&store, "obs-1");
        let set_species = |species: &str| ObservationEdit {
            species_id: Some(species.to_string()),
            ..Default::default()
        };

        let err = store.apply_edit(&id, &set_species("sp-unknown"), &editor(), None).unwrap_err();
        assert!(matches!(err, StoreError::UnknownSpecies(ref s) if s == "sp-unknown"));

        let err = store.apply_edit(&id, &set_species("sp-boar"), &editor(), None).unwrap_err();
        assert!(matches!(err, StoreError::SpeciesNotInProject { ref species_id, .. } if species_id == "sp-boar"));

        // Rejected edits leave no trace
        assert!(store.get_revisions_for_observation(&id).unwrap().is_empty());

        // Switching to a linked species clears the review flag
        assert_eq!(
            store.load_observation(&id).unwrap().unwrap().failures,
            vec![FailureFlag::NewSpecies]
        );
        store.apply_edit(&id, &set_species("sp-deer"), &editor(), None).unwrap();
        let stored = store.load_observation(&id).unwrap().unwrap();
        assert_eq!(stored.state.species_id, Some("sp-deer".to_string()));
        assert!(stored.failures.is_empty());
    }

    #[test]
    fn test_edit_rejects_invalid_values() {
        let mut store = create_test_store();
        import_rows(
            &mut store,
            PROJECT,
            &[&["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "", "", "obs-1"]],
        );
        let id = external(&store, "obs-1");

        let edit = ObservationEdit {
            fields: vec![FieldInput::new("c-weather", "Sunny")],
            ..Default::default()
        };
        let err = store.apply_edit(&id, &edit, &editor(), None).unwrap_err();
        assert!(matches!(err, StoreError::Field(FieldError::InvalidOption(_))));

        let err = store.apply_edit(&id, &rename("  "), &editor(), None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEdit(_)));

        let err = store.apply_edit("missing", &rename("x.jpg"), &editor(), None).unwrap_err();
        assert!(matches!(err, StoreError::ObservationNotFound(_)));
    }

    #[test]
    fn test_rollback_restores_and_persists() {
        let mut store = create_test_store();
        import_rows(
            &mut store,
            PROJECT,
            &[&["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "Deer", "", "obs-1"]],
        );
        let id = external(&store, "obs-1");

        let first = store.apply_edit(&id, &rename("a.jpg"), &editor(), None).unwrap();
        let second = store.apply_edit(&id, &rename("b.jpg"), &editor(), Some(&first.id)).unwrap();

        // An editor still looking at `first` may not roll back
        let err = store.apply_rollback(&id, &first.id, &editor(), Some(&first.id)).unwrap_err();
        assert!(matches!(err, StoreError::Ledger(LedgerError::Conflict { .. })));

        let rolled = store.apply_rollback(&id, &first.id, &editor(), Some(&second.id)).unwrap();

        let stored = store.load_observation(&id).unwrap().unwrap();
        assert_eq!(stored.state.filename, "a.jpg");
        let records = store.get_revisions_for_observation(&id).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records.iter().filter(|r| r.is_current).count(), 1);
        assert_eq!(records[2].revision.id, rolled.id);

        let err = store.apply_rollback(&id, "no-such-revision", &editor(), Some(&rolled.id)).unwrap_err();
        assert!(matches!(err, StoreError::Ledger(LedgerError::NotFound { .. })));

        let kinds: Vec<EventKind> = store.observation_events(&id).unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds.last(), Some(&EventKind::ObservationRolledBack));
    }

    #[test]
    fn test_species_counts() {
        let mut store = create_test_store();
        import_rows(
            &mut store,
            PROJECT,
            &[
                &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "Deer", "", ""],
                &["Zone A", "", "Station 1", "2.jpg", "2020-01-01 09:00:00", "Deer", "", ""],
                &["Zone A", "", "Station 1", "3.jpg", "2020-01-01 10:00:00", "Civet", "", ""],
                &["Zone A", "", "Station 1", "4.jpg", "2020-01-01 11:00:00", "", "", ""],
            ],
        );

        let counts = store.species_counts(PROJECT).unwrap();

        assert_eq!(counts.len(), 3);
        assert_eq!(counts[0].species_id, Some("sp-deer".to_string()));
        assert_eq!(counts[0].count, 2);
        let civet = counts.iter().find(|c| c.label.as_deref() == Some("Civet")).unwrap();
        assert_eq!(civet.count, 1);
        let unidentified = counts.iter().find(|c| c.species_id.is_none()).unwrap();
        assert_eq!(unidentified.count, 1);
        assert!(store.species_counts("project-2").unwrap().is_empty());
    }

    #[test]
    fn test_species_time_series() {
        let mut store = create_test_store();
        import_rows(
            &mut store,
            PROJECT,
            &[
                &["Zone A", "", "Station 1", "1.jpg", "2020-01-15 08:00:00", "Deer", "", ""],
                &["Zone A", "", "Station 1", "2.jpg", "2020-03-01 08:00:00", "Deer", "", ""],
                &["Zone A", "", "Station 1", "3.jpg", "2020-03-02 08:00:00", "", "", ""],
                &["Zone B", "", "Station 1", "4.jpg", "2020-03-03 08:00:00", "Deer", "", ""],
            ],
        );

        let series = store.species_time_series(PROJECT, 480).unwrap();

        assert_eq!(series.len(), 2);
        let zone_a = series.iter().find(|s| s.zone_id == "z-a").unwrap();
        let months: Vec<(u32, usize)> = zone_a.metrics.iter().map(|m| (m.month, m.species.len())).collect();
        assert_eq!(months, vec![(1, 1), (2, 0), (3, 1)]);
        assert_eq!(zone_a.metrics[2].species[0].records, 1);
        assert_eq!(zone_a.zone_label, "Zone A");
    }

    #[test]
    fn test_find_observations_by_zone_tree_and_time() {
        let mut store = create_test_store();
        import_rows(
            &mut store,
            PROJECT,
            &[
                &["Zone A", "", "Station 1", "1.jpg", "2020-01-01 08:00:00", "", "", ""],
                &["Zone A", "Sub 1", "Station 1", "2.jpg", "2020-01-02 08:00:00", "", "", ""],
                &["Zone A", "Sub 1", "Station 1", "3.jpg", "2020-01-03 08:00:00", "", "", ""],
                &["Zone B", "", "Station 1", "4.jpg", "2020-01-02 09:00:00", "", "", ""],
            ],
        );
        let filenames = |query: &ObservationQuery| -> Vec<String> {
            store
                .find_observations(PROJECT, query)
                .unwrap()
                .into_iter()
                .map(|o| o.state.filename)
                .collect()
        };

        let parent = ObservationQuery {
            zone_id: Some("z-a".to_string()),
            ..Default::default()
        };
        assert_eq!(filenames(&parent), vec!["1.jpg", "2.jpg", "3.jpg"]);

        let child = ObservationQuery {
            zone_id: Some("z-a1".to_string()),
            ..Default::default()
        };
        assert_eq!(filenames(&child), vec!["2.jpg", "3.jpg"]);

        // Both bounds apply, inclusively (times are GMT+8 on the sheet)
        let window = ObservationQuery {
            zone_id: Some("z-a".to_string()),
            start: Some(Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap()),
            end: Some(Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        assert_eq!(filenames(&window), vec!["2.jpg"]);

        let stations = ObservationQuery {
            station_ids: vec!["s-1".to_string(), "s-b1".to_string()],
            ..Default::default()
        };
        assert_eq!(filenames(&stations), vec!["1.jpg", "4.jpg"]);

        let err = store
            .find_observations(
                PROJECT,
                &ObservationQuery {
                    zone_id: Some("z-x".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownZone(_)));
    }
}
