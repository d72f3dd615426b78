//! Regular tiling of an extent into rows and columns.
//!
//! Row `0` lies along the minimum y edge and column `0` along the minimum x
//! edge. Tiles are produced in row-major order. Adjacent tiles share their
//! boundary coordinates exactly, and only the last row and column include
//! the maximum edge of the extent.

use std::fmt;
use std::str::FromStr;

use geo::{Coord, Rect};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::filter::{Predicate, ReferenceSystem, TileFilter};

/// Errors raised when building a tiling.
#[derive(Debug, Error, PartialEq)]
pub enum TilingError {
    /// Rows or columns were zero.
    #[error("tiling requires at least one row and one column (got {rows}x{columns})")]
    EmptyGrid {
        /// Requested rows.
        rows: u32,
        /// Requested columns.
        columns: u32,
    },
    /// The extent had no area or non-finite coordinates.
    #[error("tiling extent must be finite with positive width and height")]
    DegenerateExtent,
    /// A tile index lay outside the grid.
    #[error("tile ({row}, {column}) is outside the {rows}x{columns} grid")]
    OutOfRange {
        /// Requested row.
        row: u32,
        /// Requested column.
        column: u32,
        /// Grid rows.
        rows: u32,
        /// Grid columns.
        columns: u32,
    },
}

/// Naming scheme for per-tile output folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TileSuffixMode {
    /// `{row}_{column}`.
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "row_column"))]
    RowColumn,
    /// `{xmin}_{ymin}`.
    #[cfg_attr(feature = "serde", serde(rename = "xmin_ymin"))]
    XMinYMin,
    /// `{xmax}_{ymin}`.
    #[cfg_attr(feature = "serde", serde(rename = "xmax_ymin"))]
    XMaxYMin,
    /// `{xmin}_{ymax}`.
    #[cfg_attr(feature = "serde", serde(rename = "xmin_ymax"))]
    XMinYMax,
    /// `{xmax}_{ymax}`.
    #[cfg_attr(feature = "serde", serde(rename = "xmax_ymax"))]
    XMaxYMax,
    /// `{xmin}_{ymin}_{xmax}_{ymax}`.
    #[cfg_attr(feature = "serde", serde(rename = "xmin_ymin_xmax_ymax"))]
    XMinYMinXMaxYMax,
}

impl TileSuffixMode {
    /// Return the configuration name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RowColumn => "row_column",
            Self::XMinYMin => "xmin_ymin",
            Self::XMaxYMin => "xmax_ymin",
            Self::XMinYMax => "xmin_ymax",
            Self::XMaxYMax => "xmax_ymax",
            Self::XMinYMinXMaxYMax => "xmin_ymin_xmax_ymax",
        }
    }
}

impl fmt::Display for TileSuffixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TileSuffixMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "row_column" => Ok(Self::RowColumn),
            "xmin_ymin" => Ok(Self::XMinYMin),
            "xmax_ymin" => Ok(Self::XMaxYMin),
            "xmin_ymax" => Ok(Self::XMinYMax),
            "xmax_ymax" => Ok(Self::XMaxYMax),
            "xmin_ymin_xmax_ymax" => Ok(Self::XMinYMinXMaxYMax),
            _ => Err(format!("unknown tile suffix mode '{s}'")),
        }
    }
}

/// Whether per-tile file names also carry the tile suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TileNameSuffixMode {
    /// Keep the file name; only the folder is suffixed.
    #[default]
    None,
    /// Insert the folder suffix before the first `.` of the file name.
    SameAsPath,
}

impl FromStr for TileNameSuffixMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "none" => Ok(Self::None),
            "same_as_path" => Ok(Self::SameAsPath),
            _ => Err(format!("unknown tile name suffix mode '{s}'")),
        }
    }
}

/// Insert `_{suffix}` before the first `.` of `file_name`.
///
/// # Examples
/// ```
/// use cartage_core::tiling::insert_name_suffix;
///
/// assert_eq!(insert_name_suffix("city.gml", "0_1"), "city_0_1.gml");
/// assert_eq!(insert_name_suffix("city", "0_1"), "city_0_1");
/// ```
#[must_use]
pub fn insert_name_suffix(file_name: &str, suffix: &str) -> String {
    match file_name.split_once('.') {
        Some((stem, rest)) => format!("{stem}_{suffix}.{rest}"),
        None => format!("{file_name}_{suffix}"),
    }
}

/// One cell of a [`Tiling`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tile {
    /// Row index, `0` along the minimum y edge.
    pub row: u32,
    /// Column index, `0` along the minimum x edge.
    pub column: u32,
    /// Bounding rectangle.
    pub extent: Rect<f64>,
    closed_max_x: bool,
    closed_max_y: bool,
}

impl Tile {
    /// Membership filter of the tile.
    #[must_use]
    pub const fn tile_filter(&self) -> TileFilter {
        TileFilter::new(self.extent, self.closed_max_x, self.closed_max_y)
    }

    /// Selection predicate of the tile.
    #[must_use]
    pub const fn filter(&self) -> Predicate {
        Predicate::Within(self.tile_filter())
    }

    /// Folder/file suffix of the tile for the given naming mode.
    ///
    /// # Examples
    /// ```
    /// use geo::{Coord, Rect};
    /// use cartage_core::{TileSuffixMode, Tiling};
    ///
    /// let extent = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 10.0, y: 10.0 });
    /// let tiling = Tiling::new(extent, 2, 2).unwrap();
    /// let tile = tiling.tile_at(1, 0).unwrap();
    /// assert_eq!(tile.suffix(TileSuffixMode::RowColumn), "1_0");
    /// assert_eq!(tile.suffix(TileSuffixMode::XMinYMin), "0_5");
    /// ```
    #[must_use]
    pub fn suffix(&self, mode: TileSuffixMode) -> String {
        let min = self.extent.min();
        let max = self.extent.max();
        match mode {
            TileSuffixMode::RowColumn => format!("{}_{}", self.row, self.column),
            TileSuffixMode::XMinYMin => format!("{}_{}", min.x, min.y),
            TileSuffixMode::XMaxYMin => format!("{}_{}", max.x, min.y),
            TileSuffixMode::XMinYMax => format!("{}_{}", min.x, max.y),
            TileSuffixMode::XMaxYMax => format!("{}_{}", max.x, max.y),
            TileSuffixMode::XMinYMinXMaxYMax => {
                format!("{}_{}_{}_{}", min.x, min.y, max.x, max.y)
            }
        }
    }
}

/// Grid of `rows` by `columns` equally sized tiles over an extent.
#[derive(Debug, Clone, PartialEq)]
pub struct Tiling {
    extent: Rect<f64>,
    rows: u32,
    columns: u32,
    srs: Option<ReferenceSystem>,
}

impl Tiling {
    /// Validate and build a tiling grid.
    ///
    /// # Errors
    /// Returns [`TilingError::EmptyGrid`] for zero rows or columns and
    /// [`TilingError::DegenerateExtent`] for an extent without area.
    pub fn new(extent: Rect<f64>, rows: u32, columns: u32) -> Result<Self, TilingError> {
        if rows == 0 || columns == 0 {
            return Err(TilingError::EmptyGrid { rows, columns });
        }
        let min = extent.min();
        let max = extent.max();
        let finite = [min.x, min.y, max.x, max.y].iter().all(|v| v.is_finite());
        if !finite || extent.width() <= 0.0 || extent.height() <= 0.0 {
            return Err(TilingError::DegenerateExtent);
        }
        Ok(Self {
            extent,
            rows,
            columns,
            srs: None,
        })
    }

    /// Attach the reference system the extent is expressed in.
    #[must_use]
    pub fn with_srs(mut self, srs: ReferenceSystem) -> Self {
        self.srs = Some(srs);
        self
    }

    /// Reference system of the extent, if it differs from the database's.
    #[must_use]
    pub const fn srs(&self) -> Option<&ReferenceSystem> {
        self.srs.as_ref()
    }

    /// Replace the extent, keeping rows and columns.
    ///
    /// Used once the extent has been transformed into the database
    /// reference system.
    ///
    /// # Errors
    /// Returns [`TilingError::DegenerateExtent`] when the new extent has no
    /// area.
    pub fn with_extent(&self, extent: Rect<f64>) -> Result<Self, TilingError> {
        Self::new(extent, self.rows, self.columns)
    }

    /// Overall extent.
    #[must_use]
    pub const fn extent(&self) -> Rect<f64> {
        self.extent
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub const fn columns(&self) -> u32 {
        self.columns
    }

    /// Number of tiles in the grid.
    #[must_use]
    pub fn tile_count(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.columns)
    }

    /// Tile at `(row, column)`.
    ///
    /// # Errors
    /// Returns [`TilingError::OutOfRange`] when the index lies outside the
    /// grid.
    pub fn tile_at(&self, row: u32, column: u32) -> Result<Tile, TilingError> {
        if row >= self.rows || column >= self.columns {
            return Err(TilingError::OutOfRange {
                row,
                column,
                rows: self.rows,
                columns: self.columns,
            });
        }
        Ok(self.build_tile(row, column))
    }

    /// Iterate over every tile in row-major order.
    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.rows)
            .flat_map(move |row| (0..self.columns).map(move |column| self.build_tile(row, column)))
    }

    #[expect(
        clippy::float_arithmetic,
        reason = "tile bounds subdivide the extent in floating point"
    )]
    fn build_tile(&self, row: u32, column: u32) -> Tile {
        let min = self.extent.min();
        let max = self.extent.max();
        let step_x = self.extent.width() / f64::from(self.columns);
        let step_y = self.extent.height() / f64::from(self.rows);
        let last_column = column + 1 == self.columns;
        let last_row = row + 1 == self.rows;
        // Both neighbours compute a shared edge with the same expression.
        let x0 = min.x + step_x * f64::from(column);
        let y0 = min.y + step_y * f64::from(row);
        let x1 = if last_column {
            max.x
        } else {
            min.x + step_x * f64::from(column + 1)
        };
        let y1 = if last_row {
            max.y
        } else {
            min.y + step_y * f64::from(row + 1)
        };
        Tile {
            row,
            column,
            extent: Rect::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 }),
            closed_max_x: last_column,
            closed_max_y: last_row,
        }
    }
}
