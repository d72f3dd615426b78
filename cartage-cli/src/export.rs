//! Export command implementation for the Cartage CLI.

use std::sync::Arc;

use camino::Utf8PathBuf;
use cartage_core::{TileSuffixMode, TilingConfig, TransferConfig};
use cartage_data::{JsonLinesWriterFactory, SqliteFeatureStore};
use cartage_engine::{ExportReport, Exporter, TransferContext};
use clap::Parser;
use geo::{Coord, Rect};
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_DATABASE, ARG_EXTENT, ARG_FETCH_REMOTE, ARG_MAX_THREADS, ARG_MIN_THREADS, ARG_OUTPUT,
    ARG_SKIP_EMPTY_TILES, ARG_TILE_COLUMNS, ARG_TILE_ROWS, ARG_TILE_SUFFIX, CliError,
    ENV_EXPORT_DATABASE, ENV_EXPORT_EXTENT, ENV_EXPORT_OUTPUT, ENV_EXPORT_TILE_COLUMNS,
    ENV_EXPORT_TILE_ROWS, NumericTypeNames, apply_threads, payload_fetcher, require_existing,
};

/// CLI arguments for the `export` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Write every feature of a SQLite feature database to a \
                 JSON-lines file. With a tile grid, one file is written per \
                 tile into folders next to the output path.",
    about = "Export a feature database"
)]
#[ortho_config(prefix = "CARTAGE")]
pub(crate) struct ExportArgs {
    /// Path to the SQLite feature database.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Path of the JSON-lines file to write.
    #[arg(long = ARG_OUTPUT, value_name = "path")]
    #[serde(default)]
    pub(crate) output: Option<Utf8PathBuf>,
    /// Rows of the tile grid.
    #[arg(long = ARG_TILE_ROWS, value_name = "count")]
    #[serde(default)]
    pub(crate) tile_rows: Option<u32>,
    /// Columns of the tile grid.
    #[arg(long = ARG_TILE_COLUMNS, value_name = "count")]
    #[serde(default)]
    pub(crate) tile_columns: Option<u32>,
    /// Tile folder suffix, e.g. `row_column` or `xmin_ymin`.
    #[arg(long = ARG_TILE_SUFFIX, value_name = "mode")]
    #[serde(default)]
    pub(crate) tile_suffix: Option<String>,
    /// Extent split by the tile grid as `minx,miny,maxx,maxy`.
    #[arg(long = ARG_EXTENT, value_name = "bbox")]
    #[serde(default)]
    pub(crate) extent: Option<String>,
    /// Skip tiles without matching features.
    #[arg(long = ARG_SKIP_EMPTY_TILES)]
    #[serde(default)]
    pub(crate) skip_empty_tiles: bool,
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

impl ExportArgs {
    pub(crate) fn into_config(self) -> Result<ExportConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ExportConfig::try_from(merged)
    }
}

/// Resolved `export` command configuration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExportConfig {
    /// Path to the SQLite feature database.
    pub(crate) database: Utf8PathBuf,
    /// Path of the JSON-lines output.
    pub(crate) output: Utf8PathBuf,
    /// Session settings.
    pub(crate) transfer: TransferConfig,
    /// Whether remote texture images are downloaded.
    pub(crate) fetch_remote: bool,
}

impl TryFrom<ExportArgs> for ExportConfig {
    type Error = CliError;

    fn try_from(args: ExportArgs) -> Result<Self, Self::Error> {
        let tiling = tiling_config(&args)?;
        let database = args.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_EXPORT_DATABASE,
        })?;
        let output = args.output.ok_or(CliError::MissingArgument {
            field: ARG_OUTPUT,
            env: ENV_EXPORT_OUTPUT,
        })?;
        let mut transfer = TransferConfig::default();
        transfer.tiling = tiling;
        apply_threads(&mut transfer.thread_pool, args.min_threads, args.max_threads);
        Ok(Self {
            database,
            output,
            transfer,
            fetch_remote: args.fetch_remote,
        })
    }
}

fn tiling_config(args: &ExportArgs) -> Result<Option<TilingConfig>, CliError> {
    let (rows, columns) = match (args.tile_rows, args.tile_columns) {
        (None, None) => return Ok(None),
        (Some(rows), Some(columns)) => (rows, columns),
        (None, Some(_)) => {
            return Err(CliError::MissingArgument {
                field: ARG_TILE_ROWS,
                env: ENV_EXPORT_TILE_ROWS,
            });
        }
        (Some(_), None) => {
            return Err(CliError::MissingArgument {
                field: ARG_TILE_COLUMNS,
                env: ENV_EXPORT_TILE_COLUMNS,
            });
        }
    };
    let raw_extent = args.extent.as_deref().ok_or(CliError::MissingArgument {
        field: ARG_EXTENT,
        env: ENV_EXPORT_EXTENT,
    })?;
    let mut tiling = TilingConfig::new(parse_extent(raw_extent)?, rows, columns);
    if let Some(mode) = &args.tile_suffix {
        tiling.path_suffix = mode
            .parse::<TileSuffixMode>()
            .map_err(|reason| CliError::InvalidArgument {
                field: ARG_TILE_SUFFIX,
                value: mode.clone(),
                reason,
            })?;
    }
    tiling.skip_empty_tiles = args.skip_empty_tiles;
    Ok(Some(tiling))
}

/// Parse `minx,miny,maxx,maxy` into a rectangle.
pub(crate) fn parse_extent(value: &str) -> Result<Rect<f64>, CliError> {
    let invalid = |reason: String| CliError::InvalidArgument {
        field: ARG_EXTENT,
        value: value.to_owned(),
        reason,
    };
    let numbers = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| invalid(err.to_string()))?;
    match numbers.as_slice() {
        [min_x, min_y, max_x, max_y] => Ok(Rect::new(
            Coord {
                x: *min_x,
                y: *min_y,
            },
            Coord {
                x: *max_x,
                y: *max_y,
            },
        )),
        other => Err(invalid(format!("expected 4 numbers, found {}", other.len()))),
    }
}

pub(super) fn run_export(args: ExportArgs) -> Result<ExportReport, CliError> {
    let config = resolve_export_config(args)?;
    let store = SqliteFeatureStore::open(config.database.as_std_path()).map_err(|source| {
        CliError::OpenDatabase {
            path: config.database.clone(),
            source: Box::new(source),
        }
    })?;
    let context = TransferContext::new(
        config.transfer.clone(),
        Arc::new(store),
        Arc::new(NumericTypeNames),
    );
    let mut exporter = Exporter::new(context, Arc::new(JsonLinesWriterFactory));
    if let Some(fetcher) = payload_fetcher(config.fetch_remote)? {
        exporter = exporter.with_payload_fetcher(fetcher);
    }
    Ok(exporter.run(&config.output)?)
}

fn resolve_export_config(args: ExportArgs) -> Result<ExportConfig, CliError> {
    let config = args.into_config()?;
    require_existing(&config.database, ARG_DATABASE)?;
    Ok(config)
}
