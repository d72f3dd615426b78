//! Per-tile predicates, output paths and the skip-empty-tile decision.

use camino::{Utf8Path, Utf8PathBuf};
use cartage_core::{DatabaseAdapter, Predicate, Tile, TileFilter, Tiling, TilingConfig};
use cartage_fs::tile_output_path;
use log::debug;

use crate::error::{ErrorCode, TransferError};

/// Work of one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePlan {
    /// The tile.
    pub tile: Tile,
    /// Tile filter combined with the session predicate.
    pub predicate: Predicate,
    /// File receiving the tile's features.
    pub output: Utf8PathBuf,
}

/// Derives the work of every tile of a tiled export.
pub struct TileDriver<'a> {
    database: &'a dyn DatabaseAdapter,
    config: &'a TilingConfig,
    tiling: Tiling,
    base: Predicate,
}

impl<'a> TileDriver<'a> {
    /// Driver for `config`, narrowing `base` to each tile.
    ///
    /// # Errors
    /// Returns [`TransferError`] when the tiling is invalid.
    pub fn new(
        database: &'a dyn DatabaseAdapter,
        config: &'a TilingConfig,
        base: Predicate,
    ) -> Result<Self, TransferError> {
        let tiling = config.tiling().map_err(|err| {
            TransferError::coded(ErrorCode::Configuration, "invalid tiling", err)
        })?;
        Ok(Self {
            database,
            config,
            tiling,
            base,
        })
    }

    /// Number of tiles.
    #[must_use]
    pub fn tile_count(&self) -> u64 {
        self.tiling.tile_count()
    }

    /// Tiles in row-major order.
    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        self.tiling.tiles()
    }

    /// Predicate and output path of `tile` for the export to `output`.
    ///
    /// When the tiling carries its own reference system the tile extent
    /// is transformed to the database's first.
    ///
    /// # Errors
    /// Returns [`TransferError`] when the extent cannot be transformed.
    pub fn plan(&self, tile: &Tile, output: &Utf8Path) -> Result<TilePlan, TransferError> {
        let bounds = tile.tile_filter();
        let filter = match self.tiling.srs() {
            Some(srs) => {
                let extent = self
                    .database
                    .transform_extent(tile.extent, srs)
                    .map_err(|err| {
                        TransferError::coded(
                            ErrorCode::ReferenceSystemMismatch,
                            format!(
                                "failed to transform the extent of tile ({}, {})",
                                tile.row, tile.column
                            ),
                            err,
                        )
                    })?;
                TileFilter::new(extent, bounds.closed_max_x(), bounds.closed_max_y())
            }
            None => bounds,
        };
        let suffix = tile.suffix(self.config.path_suffix);
        let path = tile_output_path(
            output,
            &self.config.path_prefix,
            &suffix,
            self.config.name_suffix,
        );
        Ok(TilePlan {
            tile: *tile,
            predicate: Predicate::Within(filter).and(self.base.clone()),
            output: path,
        })
    }

    /// Whether `plan` matches no feature and may be skipped.
    ///
    /// Always `false` unless empty tiles are to be skipped.
    ///
    /// # Errors
    /// Returns [`TransferError`] when counting fails.
    pub fn skip(&self, plan: &TilePlan) -> Result<bool, TransferError> {
        if !self.config.skip_empty_tiles {
            return Ok(false);
        }
        let matched = self.database.count(&plan.predicate).map_err(|err| {
            TransferError::coded(ErrorCode::Database, "failed to count tile features", err)
        })?;
        if matched == 0 {
            debug!("tile ({}, {}) is empty", plan.tile.row, plan.tile.column);
        }
        Ok(matched == 0)
    }
}
