//! Session configuration.
//!
//! All settings have defaults so an empty configuration file is valid.
//! [`TransferConfig::validate`] is called by the controllers before any
//! resource is created.

use std::path::PathBuf;
use std::str::FromStr;

use geo::Rect;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::filter::ReferenceSystem;
use crate::pool::PoolSettings;
use crate::tiling::{TileNameSuffixMode, TileSuffixMode, Tiling, TilingError};

/// Configuration rejected by [`TransferConfig::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A value was outside its permitted range.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },
    /// The tiling grid was invalid.
    #[error("invalid tiling: {0}")]
    Tiling(#[from] TilingError),
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        message: message.into(),
    }
}

/// Worker thread bounds shared by the main and resolution pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ThreadPoolConfig {
    /// Threads started eagerly.
    pub min_threads: usize,
    /// Upper bound on threads.
    pub max_threads: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: std::thread::available_parallelism().map_or(4, std::num::NonZero::get),
        }
    }
}

/// Sizing of one id cache.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheSizing {
    /// Entries kept in memory across all partitions.
    pub cache_size: usize,
    /// Share of a full partition evicted to the backing table at once.
    pub page_factor: f64,
    /// Number of independently locked partitions.
    pub partitions: usize,
}

impl Default for CacheSizing {
    fn default() -> Self {
        Self {
            cache_size: 200_000,
            page_factor: 0.85,
            partitions: 10,
        }
    }
}

impl CacheSizing {
    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.cache_size == 0 {
            return Err(invalid(field, "cache_size must be positive"));
        }
        if self.partitions == 0 {
            return Err(invalid(field, "partitions must be positive"));
        }
        if !(self.page_factor > 0.0 && self.page_factor <= 1.0) {
            return Err(invalid(field, "page_factor must lie in (0, 1]"));
        }
        Ok(())
    }
}

/// Sizing of the feature and geometry id caches.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IdCacheConfig {
    /// Cache of feature ids.
    pub feature: CacheSizing,
    /// Cache of geometry ids.
    pub geometry: CacheSizing,
}

/// Round-trip batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BatchConfig {
    /// Deferred records buffered per kind before a flush.
    pub deferred_batch_size: usize,
    /// Id cache entries written per spill transaction.
    pub id_cache_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            deferred_batch_size: 20,
            id_cache_batch_size: 1000,
        }
    }
}

/// Tiled export settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TilingConfig {
    /// Rows of the grid.
    pub rows: u32,
    /// Columns of the grid.
    pub columns: u32,
    /// Extent to split.
    pub extent: Rect<f64>,
    /// Reference system of `extent` when it differs from the database's.
    #[cfg_attr(feature = "serde", serde(default))]
    pub srs: Option<ReferenceSystem>,
    /// Folder prefix of each tile.
    #[cfg_attr(feature = "serde", serde(default = "default_path_prefix"))]
    pub path_prefix: String,
    /// Folder suffix scheme.
    #[cfg_attr(feature = "serde", serde(default))]
    pub path_suffix: TileSuffixMode,
    /// Whether file names repeat the folder suffix.
    #[cfg_attr(feature = "serde", serde(default))]
    pub name_suffix: TileNameSuffixMode,
    /// Skip creating output for tiles without matches.
    #[cfg_attr(feature = "serde", serde(default))]
    pub skip_empty_tiles: bool,
    /// Continue with the next tile when a tile's filter cannot be built.
    #[cfg_attr(feature = "serde", serde(default))]
    pub continue_on_tile_error: bool,
}

#[cfg(feature = "serde")]
fn default_path_prefix() -> String {
    "tile".to_owned()
}

impl TilingConfig {
    /// Grid over `extent` with default naming.
    #[must_use]
    pub fn new(extent: Rect<f64>, rows: u32, columns: u32) -> Self {
        Self {
            rows,
            columns,
            extent,
            srs: None,
            path_prefix: "tile".to_owned(),
            path_suffix: TileSuffixMode::default(),
            name_suffix: TileNameSuffixMode::default(),
            skip_empty_tiles: false,
            continue_on_tile_error: false,
        }
    }

    /// Build the validated tiling grid.
    ///
    /// # Errors
    /// Returns [`TilingError`] for empty grids or degenerate extents.
    pub fn tiling(&self) -> Result<Tiling, TilingError> {
        let tiling = Tiling::new(self.extent, self.rows, self.columns)?;
        Ok(match &self.srs {
            Some(srs) => tiling.with_srs(srs.clone()),
            None => tiling,
        })
    }
}

/// Export-only switches.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExportOptions {
    /// Emit group members as references instead of inline copies.
    pub group_members_as_xlinks: bool,
    /// Folder next to the output file receiving texture images.
    pub texture_folder: String,
    /// Whether texture images are copied at all.
    pub export_textures: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            group_members_as_xlinks: false,
            texture_folder: "appearance".to_owned(),
            export_textures: true,
        }
    }
}

/// Treatment of external ids during import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum IdMode {
    /// Generate an id only for features without one.
    #[default]
    Complement,
    /// Replace every id, keeping the original as an attribute.
    Replace,
}

/// Id generation settings for import.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IdHandling {
    /// Prefix of generated ids.
    pub prefix: String,
    /// Generation mode.
    pub mode: IdMode,
}

impl Default for IdHandling {
    fn default() -> Self {
        Self {
            prefix: "UUID_".to_owned(),
            mode: IdMode::default(),
        }
    }
}

/// How the import log file is named or reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ImportLogMode {
    /// Write a new, timestamped file per session.
    #[default]
    Unique,
    /// Append to the configured file.
    Append,
    /// Truncate the configured file.
    Truncate,
}

impl FromStr for ImportLogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unique" => Ok(Self::Unique),
            "append" => Ok(Self::Append),
            "truncate" => Ok(Self::Truncate),
            _ => Err(format!("unknown import log mode '{s}'")),
        }
    }
}

/// Import log settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ImportLogConfig {
    /// Whether imported features are logged.
    pub enabled: bool,
    /// Naming mode.
    pub mode: ImportLogMode,
    /// Log file, or its directory in [`ImportLogMode::Unique`] mode.
    pub file: Option<PathBuf>,
}

/// Import-only settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ImportOptions {
    /// Id generation.
    pub id_handling: IdHandling,
    /// Import log.
    pub log: ImportLogConfig,
    /// Directory relative payload paths are resolved against.
    pub base_path: Option<PathBuf>,
}

/// Settings of one transfer session.
///
/// # Examples
/// ```
/// use cartage_core::TransferConfig;
///
/// let config = TransferConfig::default();
/// assert_eq!(config.queue_capacity, 300);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TransferConfig {
    /// Worker thread bounds.
    pub thread_pool: ThreadPoolConfig,
    /// Capacity of each pool's work queue.
    pub queue_capacity: usize,
    /// Id cache sizing.
    pub id_cache: IdCacheConfig,
    /// Batching.
    pub batching: BatchConfig,
    /// Optional tiling.
    pub tiling: Option<TilingConfig>,
    /// Export switches.
    pub export: ExportOptions,
    /// Import switches.
    pub import: ImportOptions,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            thread_pool: ThreadPoolConfig::default(),
            queue_capacity: 300,
            id_cache: IdCacheConfig::default(),
            batching: BatchConfig::default(),
            tiling: None,
            export: ExportOptions::default(),
            import: ImportOptions::default(),
        }
    }
}

impl TransferConfig {
    /// Check every bound before a session starts.
    ///
    /// # Errors
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threads = &self.thread_pool;
        if threads.min_threads == 0 {
            return Err(invalid("thread_pool.min_threads", "must be positive"));
        }
        if threads.min_threads > threads.max_threads {
            return Err(invalid(
                "thread_pool.max_threads",
                format!(
                    "{} is below min_threads {}",
                    threads.max_threads, threads.min_threads
                ),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be positive"));
        }
        self.id_cache.feature.validate("id_cache.feature")?;
        self.id_cache.geometry.validate("id_cache.geometry")?;
        if self.batching.deferred_batch_size == 0 {
            return Err(invalid("batching.deferred_batch_size", "must be positive"));
        }
        if self.batching.id_cache_batch_size == 0 {
            return Err(invalid("batching.id_cache_batch_size", "must be positive"));
        }
        if let Some(tiling) = &self.tiling {
            tiling.tiling()?;
        }
        Ok(())
    }

    /// Settings of the main-pass pool.
    #[must_use]
    pub const fn main_pool(&self) -> PoolSettings {
        PoolSettings {
            min_threads: self.thread_pool.min_threads,
            max_threads: self.thread_pool.max_threads,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Settings of the resolution pool: at most half the main pool's
    /// threads, and at least one.
    #[must_use]
    #[expect(
        clippy::integer_division,
        reason = "rounding down keeps the resolution pool within half"
    )]
    pub fn resolution_pool(&self) -> PoolSettings {
        let max_threads = (self.thread_pool.max_threads / 2).max(1);
        PoolSettings {
            min_threads: 1,
            max_threads,
            queue_capacity: self.queue_capacity,
        }
    }
}
