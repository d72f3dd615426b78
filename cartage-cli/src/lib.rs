//! Command-line interface for Cartage transfer sessions.
//!
//! `cartage export` writes a SQLite feature database to JSON-lines files,
//! optionally split into tiles. `cartage import` loads JSON-lines features
//! into a SQLite feature database. Options are layered from CLI flags,
//! configuration files and `CARTAGE_`-prefixed environment variables.
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use camino::Utf8Path;
use cartage_core::{FeatureTypeId, PayloadFetcher, SchemaMapping, ThreadPoolConfig};
use cartage_data::HttpPayloadFetcher;
use cartage_engine::{ExportReport, ImportReport};
use clap::{Parser, Subcommand};

mod error;
mod export;
mod import;

pub use error::CliError;

use export::ExportArgs;
use import::ImportArgs;

const ARG_DATABASE: &str = "database";
const ARG_OUTPUT: &str = "output";
const ARG_INPUT: &str = "input";
const ARG_TILE_ROWS: &str = "tile-rows";
const ARG_TILE_COLUMNS: &str = "tile-columns";
const ARG_TILE_SUFFIX: &str = "tile-suffix";
const ARG_EXTENT: &str = "extent";
const ARG_SKIP_EMPTY_TILES: &str = "skip-empty-tiles";
const ARG_MIN_THREADS: &str = "min-threads";
const ARG_MAX_THREADS: &str = "max-threads";
const ARG_ID_PREFIX: &str = "id-prefix";
const ARG_REPLACE_IDS: &str = "replace-ids";
const ARG_IMPORT_LOG: &str = "import-log";
const ARG_IMPORT_LOG_MODE: &str = "import-log-mode";
const ARG_SPATIAL_INDEX: &str = "spatial-index";
const ARG_FETCH_REMOTE: &str = "fetch-remote";
const ENV_EXPORT_DATABASE: &str = "CARTAGE_CMDS_EXPORT_DATABASE";
const ENV_EXPORT_OUTPUT: &str = "CARTAGE_CMDS_EXPORT_OUTPUT";
const ENV_EXPORT_EXTENT: &str = "CARTAGE_CMDS_EXPORT_EXTENT";
const ENV_EXPORT_TILE_ROWS: &str = "CARTAGE_CMDS_EXPORT_TILE_ROWS";
const ENV_EXPORT_TILE_COLUMNS: &str = "CARTAGE_CMDS_EXPORT_TILE_COLUMNS";
const ENV_IMPORT_INPUT: &str = "CARTAGE_CMDS_IMPORT_INPUT";
const ENV_IMPORT_DATABASE: &str = "CARTAGE_CMDS_IMPORT_DATABASE";

const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the Cartage CLI with the current process arguments and environment.
///
/// # Errors
/// Returns [`CliError`] when the arguments are invalid or the session fails.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    let outcome = execute(cli)?;
    summarise(&outcome);
    Ok(())
}

/// Result of one CLI invocation.
#[derive(Debug)]
enum Outcome {
    Exported(ExportReport),
    Imported(ImportReport),
}

fn execute(cli: Cli) -> Result<Outcome, CliError> {
    match cli.command {
        Command::Export(args) => export::run_export(args).map(Outcome::Exported),
        Command::Import(args) => import::run_import(args).map(Outcome::Imported),
    }
}

fn summarise(outcome: &Outcome) {
    let interrupt = match outcome {
        Outcome::Exported(report) => {
            log::info!(
                "exported {} objects into {} file(s); {} references resolved, {} unresolved",
                report.totals.total_objects(),
                report.tiles.iter().filter(|tile| !tile.skipped).count(),
                report.resolution.resolved,
                report.resolution.unresolved
            );
            report.interrupt.as_deref()
        }
        Outcome::Imported(report) => {
            log::info!(
                "imported {} objects; {} references resolved, {} unresolved",
                report.counters.total_objects(),
                report.resolution.resolved,
                report.resolution.unresolved
            );
            if report.skipped > 0 {
                log::warn!("skipped {} undecodable records", report.skipped);
            }
            report.interrupt.as_deref()
        }
    };
    if let Some(reason) = interrupt {
        log::warn!("session stopped early: {reason}");
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "cartage",
    about = "Move city model features between feature databases and files",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Export a feature database to JSON-lines files.
    Export(ExportArgs),
    /// Import JSON-lines features into a feature database.
    Import(ImportArgs),
}

/// Schema without registered names; feature types are logged by number.
#[derive(Debug, Clone, Copy, Default)]
struct NumericTypeNames;

impl SchemaMapping for NumericTypeNames {
    fn type_name(&self, _type_id: FeatureTypeId) -> Option<String> {
        None
    }
}

fn apply_threads(
    pool: &mut ThreadPoolConfig,
    min_threads: Option<usize>,
    max_threads: Option<usize>,
) {
    if let Some(min) = min_threads {
        pool.min_threads = min;
        pool.max_threads = pool.max_threads.max(min);
    }
    if let Some(max) = max_threads {
        pool.max_threads = max;
    }
}

fn payload_fetcher(fetch_remote: bool) -> Result<Option<Arc<dyn PayloadFetcher>>, CliError> {
    if !fetch_remote {
        return Ok(None);
    }
    let fetcher = HttpPayloadFetcher::new(REMOTE_TIMEOUT).map_err(CliError::BuildFetcher)?;
    Ok(Some(Arc::new(fetcher)))
}

fn require_existing(path: &Utf8Path, field: &'static str) -> Result<(), CliError> {
    match cartage_fs::file_is_file(path) {
        Ok(true) => Ok(()),
        Ok(false) => Err(CliError::SourcePathNotFile {
            field,
            path: path.to_path_buf(),
        }),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            Err(CliError::MissingSourceFile {
                field,
                path: path.to_path_buf(),
            })
        }
        Err(source) => Err(CliError::InspectSourcePath {
            field,
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests;
