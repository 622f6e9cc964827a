use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use camtrap_import::{
    format_local_time, import_csv, parse_local_time, AppConfig, CatalogProvider, CatalogSeed, FieldInput,
    ObservationEdit, ObservationQuery, PersistenceGateway, SqliteStore, UserIdentity,
};

#[derive(Parser, Debug)]
#[command(name = "camtrap-import")]
#[command(about = "Camera-trap sheet importer with revision history")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $CAMTRAP_CONFIG, then ./camtrap.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database, overrides the config file
    #[arg(long, global = true, env = "CAMTRAP_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema
    Init,

    /// Load zones, stations, species and columns from a JSON file
    Seed {
        file: PathBuf,
        #[arg(long)]
        project: String,
    },

    /// Import a CSV sheet into a project
    Import {
        csv: PathBuf,
        #[arg(long)]
        project: String,
        /// Minutes east of UTC the sheet's times were recorded at
        #[arg(long, allow_hyphen_values = true)]
        timezone: Option<i32>,
        /// Resolve and report without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Authorize a species for a project and clear its review flags
    LinkSpecies {
        #[arg(long)]
        project: String,
        #[arg(long)]
        species: String,
    },

    /// Edit an observation and record the result as a new revision
    Edit {
        observation: String,
        #[arg(long)]
        species: Option<String>,
        #[arg(long)]
        filename: Option<String>,
        /// Custom value as COLUMN_ID=VALUE (RFC 3339 times, option ids)
        #[arg(long = "field", value_parser = parse_field_input)]
        fields: Vec<FieldInput>,
        /// Revision the edit is based on; defaults to the current one
        #[arg(long)]
        expect: Option<String>,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        user_name: String,
    },

    /// List the revisions of an observation
    History { observation: String },

    /// Restore an observation to an earlier revision
    Rollback {
        observation: String,
        revision: String,
        /// Revision the rollback is based on; defaults to the current one
        #[arg(long)]
        expect: Option<String>,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        user_name: String,
    },

    /// List observations by zone (with sub-zones), station and time range
    Find {
        #[arg(long)]
        project: String,
        #[arg(long)]
        zone: Option<String>,
        #[arg(long = "station")]
        stations: Vec<String>,
        /// Local wall-clock time, inclusive
        #[arg(long)]
        start: Option<String>,
        /// Local wall-clock time, inclusive
        #[arg(long)]
        end: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        timezone: Option<i32>,
    },

    /// Species counts and monthly records per zone
    Report {
        #[arg(long)]
        project: String,
        #[arg(long, allow_hyphen_values = true)]
        timezone: Option<i32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    init_tracing(&config.log_filter)?;

    match cli.command {
        Command::Init => run_init(&config),
        Command::Seed { file, project } => run_seed(&config, &file, &project),
        Command::Import {
            csv,
            project,
            timezone,
            dry_run,
        } => run_import(&config, &csv, &project, timezone, dry_run),
        Command::LinkSpecies { project, species } => run_link_species(&config, &project, &species),
        Command::Edit {
            observation,
            species,
            filename,
            fields,
            expect,
            user_id,
            user_name,
        } => {
            let edit = ObservationEdit {
                species_id: species,
                filename,
                fields,
            };
            run_edit(&config, &observation, &edit, expect, UserIdentity::new(user_id, user_name))
        }
        Command::History { observation } => run_history(&config, &observation),
        Command::Rollback {
            observation,
            revision,
            expect,
            user_id,
            user_name,
        } => run_rollback(&config, &observation, &revision, expect, UserIdentity::new(user_id, user_name)),
        Command::Find {
            project,
            zone,
            stations,
            start,
            end,
            timezone,
        } => {
            let timezone = timezone.unwrap_or(config.default_timezone_minutes);
            let query = ObservationQuery {
                zone_id: zone,
                station_ids: stations,
                start: start.map(|t| parse_local_time(&t, timezone)).transpose()?,
                end: end.map(|t| parse_local_time(&t, timezone)).transpose()?,
            };
            run_find(&config, &project, &query, timezone)
        }
        Command::Report { project, timezone } => {
            run_report(&config, &project, timezone.unwrap_or(config.default_timezone_minutes))
        }
    }
}

fn parse_field_input(raw: &str) -> Result<FieldInput, String> {
    raw.split_once('=')
        .map(|(column, value)| FieldInput::new(column.trim(), value))
        .ok_or_else(|| format!("expected COLUMN_ID=VALUE, got '{}'", raw))
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open database: {}", config.database_path.display()))
}

fn run_init(config: &AppConfig) -> Result<()> {
    open_store(config)?;
    println!("✓ Database initialized with WAL mode: {}", config.database_path.display());
    Ok(())
}

fn run_seed(config: &AppConfig, file: &Path, project: &str) -> Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read catalog file: {}", file.display()))?;
    let seed: CatalogSeed =
        serde_json::from_str(&content).with_context(|| format!("Invalid catalog file: {}", file.display()))?;

    let mut store = open_store(config)?;
    store.seed_catalog(project, &seed)?;

    println!(
        "✓ Seeded project {}: {} zones, {} stations, {} species, {} columns",
        project,
        seed.zones.len(),
        seed.stations.len(),
        seed.species.len(),
        seed.columns.len()
    );
    Ok(())
}

fn run_import(config: &AppConfig, csv: &Path, project: &str, timezone: Option<i32>, dry_run: bool) -> Result<()> {
    let mut store = open_store(config)?;

    let columns = store.load_columns(project)?;
    if columns.is_empty() {
        bail!("Project {} has no column definitions; run `seed` first", project);
    }
    let catalogs = store.load_catalogs(project)?;
    let timezone = timezone.unwrap_or(config.default_timezone_minutes);

    println!("📂 Importing {} (UTC{:+} min)...", csv.display(), timezone);
    let mut batch = import_csv(csv, &columns, &catalogs, timezone)?;

    for duplicate in &batch.duplicates {
        println!("  ⚠️  {}", duplicate.reason);
    }

    if dry_run {
        println!("✓ Dry run: {}", batch.summary());
        return Ok(());
    }

    let persisted = store.persist_batch(project, &batch)?;
    batch.assign_species_ids(&persisted.species_ids);

    for species in &batch.new_species {
        if let Some(id) = persisted.species_ids.get(&species.provisional_key) {
            println!("  + new species {} ({})", species.label, id);
        }
    }
    println!("✓ Imported: {}", batch.summary());
    Ok(())
}

fn run_link_species(config: &AppConfig, project: &str, species: &str) -> Result<()> {
    let mut store = open_store(config)?;
    let cleared = store.link_project_species(project, species)?;

    println!("✓ Linked {} to {}; {} observations no longer flagged", species, project, cleared);
    Ok(())
}

fn run_edit(
    config: &AppConfig,
    observation_id: &str,
    edit: &ObservationEdit,
    expect: Option<String>,
    user: UserIdentity,
) -> Result<()> {
    let mut store = open_store(config)?;

    // Without --expect the edit is based on whatever is current right now
    let expected = match expect {
        Some(id) => Some(id),
        None => store.current_revision_id(observation_id)?,
    };

    let revision = store.apply_edit(observation_id, edit, &user, expected.as_deref())?;

    println!("✓ {} updated; current revision {}", observation_id, revision.id);
    Ok(())
}

fn run_history(config: &AppConfig, observation: &str) -> Result<()> {
    let store = open_store(config)?;
    let records = store.get_revisions_for_observation(observation)?;

    if records.is_empty() {
        println!("No revisions recorded for {}", observation);
        return Ok(());
    }

    for record in records {
        let revision = &record.revision;
        println!(
            "{} #{} {} by {} at {}",
            if record.is_current { "*" } else { " " },
            revision.sequence,
            revision.id,
            revision.user.name,
            revision.created_at.to_rfc3339()
        );
    }
    Ok(())
}

fn run_rollback(
    config: &AppConfig,
    observation_id: &str,
    revision_id: &str,
    expect: Option<String>,
    user: UserIdentity,
) -> Result<()> {
    let mut store = open_store(config)?;

    let expected = match expect {
        Some(id) => Some(id),
        None => store.current_revision_id(observation_id)?,
    };

    let revision = store.apply_rollback(observation_id, revision_id, &user, expected.as_deref())?;

    println!("✓ {} restored to {}; new current revision {}", observation_id, revision_id, revision.id);
    Ok(())
}

fn run_find(config: &AppConfig, project: &str, query: &ObservationQuery, timezone: i32) -> Result<()> {
    let store = open_store(config)?;
    let observations = store.find_observations(project, query)?;

    for observation in &observations {
        let state = &observation.state;
        let fields: Vec<String> = state
            .fields
            .iter()
            .map(|f| format!("{}={}", f.column_id, f.value.display(timezone)))
            .collect();
        println!(
            "{}  {}  {}/{}  {}  {}  {}",
            observation.id,
            format_local_time(state.time, timezone),
            state.zone_id,
            state.station_id,
            state.filename,
            state.species_id.as_deref().unwrap_or("-"),
            fields.join(" ")
        );
    }
    println!("✓ {} observations", observations.len());
    Ok(())
}

fn run_report(config: &AppConfig, project: &str, timezone: i32) -> Result<()> {
    let store = open_store(config)?;

    println!("📊 Species in {}", project);
    for count in store.species_counts(project)? {
        println!("  {:>6}  {}", count.count, count.label.as_deref().unwrap_or("(unidentified)"));
    }

    for zone in store.species_time_series(project, timezone)? {
        println!("\n📍 {}", zone.zone_label);
        for month in &zone.metrics {
            let species: Vec<String> = month
                .species
                .iter()
                .map(|s| format!("{} {}", s.label, s.records))
                .collect();
            println!("  {}-{:02}  {}", month.year, month.month, species.join(", "));
        }
    }
    Ok(())
}
