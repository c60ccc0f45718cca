use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use spikestitch::db::Database;
use spikestitch::paths::SessionKey;
use spikestitch::stitch::StitchScope;

#[derive(Parser)]
#[command(name = "spikestitch", version, about = "Post-sorting pipeline for high-density probe recordings")]
struct Cli {
    /// Path to the SQLite database (default: <data_root>/spikestitch.db)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Root of the session data tree
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Session selector shared by every stage command.
#[derive(Args)]
struct SessionArgs {
    /// Recording day (e.g. 240115)
    #[arg(long)]
    day: String,

    /// Recording numbers (defaults to every recording directory under the day)
    #[arg(long, value_delimiter = ',')]
    recs: Vec<String>,

    /// Recording setup name
    #[arg(long)]
    tower: String,

    /// Probe number
    #[arg(long, default_value = "1")]
    probe: i64,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeName {
    All,
    Good,
    Isolated,
}

impl ScopeName {
    fn to_scope(self) -> StitchScope {
        match self {
            Self::All => StitchScope::All,
            Self::Good => StitchScope::Good,
            Self::Isolated => StitchScope::Isolated,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StageName {
    Extract,
    Isolation,
    Rasters,
    IsoUnits,
    Stitch,
}

#[derive(Subcommand)]
enum Commands {
    /// Reproject sorter spike times into the behavioral clock and persist
    /// per-recording spike streams
    Extract {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Compute per-cluster isolation frames over time windows
    Isolation {
        #[command(flatten)]
        session: SessionArgs,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Recompute clusters that already have frames
        #[arg(long)]
        force: bool,
    },

    /// Build trial-aligned rasters per cluster
    Rasters {
        #[command(flatten)]
        session: SessionArgs,

        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        #[arg(long)]
        force: bool,
    },

    /// Derive the isolated spike stream and cluster table from curated
    /// verdicts
    IsoUnits {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Match neurons across the recordings of one session
    Stitch {
        #[command(flatten)]
        session: SessionArgs,

        /// Which clusters participate
        #[arg(long, value_enum, default_value = "all")]
        scope: ScopeName,

        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Run the pipeline stages in order
    Run {
        #[command(flatten)]
        session: SessionArgs,

        /// Subset of stages to run (default: all, in order)
        #[arg(long, value_enum, value_delimiter = ',')]
        stages: Vec<StageName>,

        #[arg(long, value_enum, default_value = "all")]
        scope: ScopeName,

        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        #[arg(long)]
        force: bool,
    },

    /// Show per-recording artifact counts
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = spikestitch::config::PipelineConfig::load();

    // Resolve data root: CLI > config
    let data_root = cli
        .data_root
        .clone()
        .or(config.data_root.clone())
        .ok_or_else(|| {
            anyhow::anyhow!("No data root. Pass --data-root or set data_root in the config file.")
        })?;

    // Resolve database path: CLI > config > per-root default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(|| spikestitch::config::default_db_path(&data_root));
    log::info!("Database: {}", db_path.display());

    let db = Database::open(&db_path).context("Failed to open database")?;

    match cli.command {
        Commands::Extract { session } => {
            let (key, recs) = resolve_session(&data_root, &session)?;
            let result = spikestitch::reproject::run_extract(&db, &config, &data_root, &key, &recs)
                .context("Extract failed")?;
            println!(
                "Extract complete: {} recordings, {} spikes, {} clusters",
                result.recordings, result.spikes, result.clusters
            );
        }

        Commands::Isolation { session, jobs, force } => {
            let (key, recs) = resolve_session(&data_root, &session)?;
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let result =
                spikestitch::isolation::run_isolation(&db, &config, &key, &recs, force, workers)
                    .context("Isolation scoring failed")?;
            println!(
                "Isolation complete: {} scored, {} skipped, {} failed",
                result.scored, result.skipped, result.failed
            );
        }

        Commands::Rasters { session, jobs, force } => {
            let (key, recs) = resolve_session(&data_root, &session)?;
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let result = spikestitch::rasters::run_rasters(
                &db, &config, &data_root, &key, &recs, force, workers,
            )
            .context("Raster extraction failed")?;
            println!(
                "Rasters complete: {} built, {} skipped, {} failed",
                result.built, result.skipped, result.failed
            );
        }

        Commands::IsoUnits { session } => {
            let (key, recs) = resolve_session(&data_root, &session)?;
            let result = spikestitch::isolated::run_isolated(&db, &key, &recs)
                .context("Isolated-unit selection failed")?;
            println!(
                "Isolated units: {} clusters, {} spikes across {} recordings",
                result.isolated_clusters, result.isolated_spikes, result.recordings
            );
        }

        Commands::Stitch { session, scope, jobs } => {
            let (key, recs) = resolve_session(&data_root, &session)?;
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let table = spikestitch::stitch::run_stitch(
                &db,
                &config,
                &data_root,
                &key,
                &recs,
                scope.to_scope(),
                workers,
            )
            .context("Stitching failed")?;
            println!(
                "Stitch complete: {} neurons across {} recordings",
                table.rows.len(),
                table.recordings.len()
            );
        }

        Commands::Run { session, stages, scope, jobs, force } => {
            let (key, recs) = resolve_session(&data_root, &session)?;
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let active = |s: StageName| stages.is_empty() || stages.contains(&s);

            log::info!(
                "Pipeline: day {} | tower {} | probe {} | {} recordings",
                key.day,
                key.tower,
                key.probe,
                recs.len()
            );

            if active(StageName::Extract) {
                log::info!("--- Stage 1: extract ---");
                spikestitch::reproject::run_extract(&db, &config, &data_root, &key, &recs)
                    .context("Extract failed")?;
            }
            if active(StageName::Isolation) {
                log::info!("--- Stage 2: isolation ---");
                spikestitch::isolation::run_isolation(&db, &config, &key, &recs, force, workers)
                    .context("Isolation scoring failed")?;
            }
            if active(StageName::Rasters) {
                log::info!("--- Stage 3: rasters ---");
                spikestitch::rasters::run_rasters(
                    &db, &config, &data_root, &key, &recs, force, workers,
                )
                .context("Raster extraction failed")?;
            }
            if active(StageName::IsoUnits) {
                log::info!("--- Stage 4: isolated units ---");
                spikestitch::isolated::run_isolated(&db, &key, &recs)
                    .context("Isolated-unit selection failed")?;
            }
            if active(StageName::Stitch) {
                log::info!("--- Stage 5: stitch ---");
                spikestitch::stitch::run_stitch(
                    &db,
                    &config,
                    &data_root,
                    &key,
                    &recs,
                    scope.to_scope(),
                    workers,
                )
                .context("Stitching failed")?;
            }
            println!("Pipeline complete.");
        }

        Commands::Stats => {
            let rows = db.recording_stats().context("Query failed")?;
            if rows.is_empty() {
                println!("No recordings in database.");
                return Ok(());
            }
            println!(
                "{:<10} {:<6} {:>10} {:>9} {:>10} {:>8}",
                "Day", "Rec", "Spikes", "Clusters", "Isolation", "Rasters"
            );
            for r in rows {
                println!(
                    "{:<10} {:<6} {:>10} {:>9} {:>10} {:>8}",
                    r.day, r.rec, r.n_spikes, r.n_clusters, r.n_isolation_clusters, r.n_rasters
                );
            }
        }
    }

    Ok(())
}

/// Resolve the session key and recording list; an empty `--recs` scans the
/// day directory.
fn resolve_session(
    data_root: &std::path::Path,
    session: &SessionArgs,
) -> Result<(SessionKey, Vec<String>)> {
    let key = SessionKey::new(&session.day, &session.tower, session.probe);
    let recs = if session.recs.is_empty() {
        let found = spikestitch::paths::list_recordings(data_root, &session.day);
        if found.is_empty() {
            anyhow::bail!(
                "No recording directories under {}/{}; pass --recs explicitly.",
                data_root.display(),
                session.day
            );
        }
        log::info!("Discovered recordings: {}", found.join(", "));
        found
    } else {
        session.recs.clone()
    };
    Ok((key, recs))
}
