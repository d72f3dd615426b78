//! Import command implementation for the Cartage CLI.

use std::{io::BufReader, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use cartage_core::{IdMode, ImportLogMode, TransferConfig};
use cartage_data::{JsonLinesReader, SqliteFeatureStore};
use cartage_engine::{ImportReport, Importer, TransferContext};
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_DATABASE, ARG_FETCH_REMOTE, ARG_ID_PREFIX, ARG_IMPORT_LOG, ARG_IMPORT_LOG_MODE, ARG_INPUT,
    ARG_MAX_THREADS, ARG_MIN_THREADS, ARG_REPLACE_IDS, ARG_SPATIAL_INDEX, CliError,
    ENV_IMPORT_DATABASE, ENV_IMPORT_INPUT, NumericTypeNames, apply_threads, payload_fetcher,
    require_existing,
};

/// CLI arguments for the `import` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Load features from a JSON-lines file into a SQLite feature \
                 database. References between features are resolved after \
                 every feature has been stored, so the input may list them \
                 in any order.",
    about = "Import JSON-lines features"
)]
#[ortho_config(prefix = "CARTAGE")]
pub(crate) struct ImportArgs {
    /// Path to the JSON-lines input.
    #[arg(long = ARG_INPUT, value_name = "path")]
    #[serde(default)]
    pub(crate) input: Option<Utf8PathBuf>,
    /// Path to the SQLite feature database, created when missing.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Prefix of generated external ids.
    #[arg(long = ARG_ID_PREFIX, value_name = "prefix")]
    #[serde(default)]
    pub(crate) id_prefix: Option<String>,
    /// Replace every external id, keeping the original as an attribute.
    #[arg(long = ARG_REPLACE_IDS)]
    #[serde(default)]
    pub(crate) replace_ids: bool,
    /// Log every imported feature to this file (a directory in `unique` mode).
    #[arg(long = ARG_IMPORT_LOG, value_name = "path")]
    #[serde(default)]
    pub(crate) import_log: Option<Utf8PathBuf>,
    /// Import log naming: `unique`, `append` or `truncate`.
    #[arg(long = ARG_IMPORT_LOG_MODE, value_name = "mode")]
    #[serde(default)]
    pub(crate) import_log_mode: Option<String>,
    /// Build the spatial index once the import finished.
    #[arg(long = ARG_SPATIAL_INDEX)]
    #[serde(default)]
    pub(crate) spatial_index: bool,
    /// Threads started eagerly.
    #[arg(long = ARG_MIN_THREADS, value_name = "count")]
    #[serde(default)]
    pub(crate) min_threads: Option<usize>,
    /// Upper bound on worker threads.
    #[arg(long = ARG_MAX_THREADS, value_name = "count")]
    #[serde(default)]
    pub(crate) max_threads: Option<usize>,
    /// Download texture images referenced by URL.
    #[arg(long = ARG_FETCH_REMOTE)]
    #[serde(default)]
    pub(crate) fetch_remote: bool,
}

impl ImportArgs {
    pub(crate) fn into_config(self) -> Result<ImportConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ImportConfig::try_from(merged)
    }
}

/// Resolved `import` command configuration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ImportConfig {
    /// Path to the JSON-lines input.
    pub(crate) input: Utf8PathBuf,
    /// Path to the SQLite feature database.
    pub(crate) database: Utf8PathBuf,
    /// Session settings.
    pub(crate) transfer: TransferConfig,
    /// Whether the spatial index is built afterwards.
    pub(crate) spatial_index: bool,
    /// Whether remote texture images are downloaded.
    pub(crate) fetch_remote: bool,
}

impl TryFrom<ImportArgs> for ImportConfig {
    type Error = CliError;

    fn try_from(args: ImportArgs) -> Result<Self, Self::Error> {
        let input = args.input.ok_or(CliError::MissingArgument {
            field: ARG_INPUT,
            env: ENV_IMPORT_INPUT,
        })?;
        let database = args.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_IMPORT_DATABASE,
        })?;
        let mut transfer = TransferConfig::default();
        let import = &mut transfer.import;
        if let Some(prefix) = args.id_prefix {
            import.id_handling.prefix = prefix;
        }
        if args.replace_ids {
            import.id_handling.mode = IdMode::Replace;
        }
        if let Some(mode) = args.import_log_mode {
            import.log.mode = mode
                .parse::<ImportLogMode>()
                .map_err(|reason| CliError::InvalidArgument {
                    field: ARG_IMPORT_LOG_MODE,
                    value: mode.clone(),
                    reason,
                })?;
        }
        if let Some(log_file) = args.import_log {
            import.log.enabled = true;
            import.log.file = Some(log_file.into_std_path_buf());
        }
        import.base_path = input_directory(&input);
        apply_threads(&mut transfer.thread_pool, args.min_threads, args.max_threads);
        Ok(Self {
            input,
            database,
            transfer,
            spatial_index: args.spatial_index,
            fetch_remote: args.fetch_remote,
        })
    }
}

/// Relative texture paths are resolved against the input's directory.
fn input_directory(input: &Utf8Path) -> Option<std::path::PathBuf> {
    input
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .map(|parent| parent.as_std_path().to_path_buf())
}

pub(super) fn run_import(args: ImportArgs) -> Result<ImportReport, CliError> {
    let config = resolve_import_config(args)?;
    let file = cartage_fs::open_utf8_file(&config.input).map_err(|source| {
        CliError::OpenInput {
            path: config.input.clone(),
            source,
        }
    })?;
    let opened = SqliteFeatureStore::open(config.database.as_std_path()).map_err(|source| {
        CliError::OpenDatabase {
            path: config.database.clone(),
            source: Box::new(source),
        }
    })?;
    let store = Arc::new(opened);
    let context = TransferContext::new(
        config.transfer.clone(),
        store.clone(),
        Arc::new(NumericTypeNames),
    );
    let mut importer = Importer::new(context);
    if let Some(fetcher) = payload_fetcher(config.fetch_remote)? {
        importer = importer.with_payload_fetcher(fetcher);
    }
    let reader = JsonLinesReader::new(BufReader::new(file));
    let report = importer.run(reader, Arc::clone(&store))?;
    if config.spatial_index {
        store
            .create_spatial_index()
            .map_err(|source| CliError::WriteSpatialIndex {
                path: config.database.clone(),
                source: Box::new(source),
            })?;
    }
    Ok(report)
}

fn resolve_import_config(args: ImportArgs) -> Result<ImportConfig, CliError> {
    let config = args.into_config()?;
    require_existing(&config.input, ARG_INPUT)?;
    Ok(config)
}
