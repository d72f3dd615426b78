//! Export controller.
//!
//! Checks the preconditions of an export, then runs the main pass and the
//! resolution pass once per output file: once for an untiled export, once
//! per tile otherwise. Id caches and deferred queues live for the whole
//! session; pools, writers and payload folders live for one file.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use cartage_core::pool::SizingStrategy;
use cartage_core::{
    CancellationHandle, Counters, FeatureWriter, FeatureWriterFactory, PayloadFetcher, Predicate,
    Query, SessionEvent, TilingConfig,
};
use cartage_data::{DirectoryPayloadStore, OfflineFetcher};
use log::{debug, error, info};

use crate::context::TransferContext;
use crate::error::{ErrorCode, FirstError, TransferError};
use crate::import::interrupt_error;
use crate::resolver::{ResolutionStats, ResolverTargets, abandon_leftovers, resolve_deferred};
use crate::session::{
    SessionMonitor, SessionResources, SessionState, SessionStatus, finish_pool, start_pool,
};
use crate::splitter::{QuerySplitter, SplitSummary, TileDriver};
use crate::worker::{ExportWorkerFactory, PassContext};

/// Outcome of one output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileReport {
    /// Tile row; zero for an untiled export.
    pub row: u32,
    /// Tile column; zero for an untiled export.
    pub column: u32,
    /// File written.
    pub output: Utf8PathBuf,
    /// Exported objects and geometries.
    pub counters: Counters,
    /// Whether the tile was skipped as empty.
    pub skipped: bool,
    /// Failure message when the tile failed and the export went on.
    pub error: Option<String>,
}

impl TileReport {
    fn new(row: u32, column: u32, output: Utf8PathBuf) -> Self {
        Self {
            row,
            column,
            output,
            counters: Counters::default(),
            skipped: false,
            error: None,
        }
    }
}

/// Result of an export session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    /// Whether every tile was processed.
    pub completed: bool,
    /// One entry per processed tile, in row-major order.
    pub tiles: Vec<TileReport>,
    /// Counters summed over every tile.
    pub totals: Counters,
    /// Resolution statistics summed over every tile.
    pub resolution: ResolutionStats,
    /// Items skipped because of per-item failures.
    pub failed_items: u64,
    /// Wall-clock duration of the session.
    pub elapsed: Duration,
    /// Message of the interrupt that stopped the session.
    pub interrupt: Option<String>,
}

struct FileOutcome {
    counters: Counters,
    resolution: ResolutionStats,
}

/// Exports features from a database to files.
///
/// # Examples
/// ```no_run
/// use std::sync::Arc;
///
/// use camino::Utf8Path;
/// use cartage_core::TransferConfig;
/// use cartage_core::test_support::StaticSchemaMapping;
/// use cartage_data::{JsonLinesWriterFactory, SqliteFeatureStore};
/// use cartage_engine::{Exporter, TransferContext};
///
/// let store = SqliteFeatureStore::open("city.sqlite").unwrap();
/// let context = TransferContext::new(
///     TransferConfig::default(),
///     Arc::new(store),
///     Arc::new(StaticSchemaMapping::new()),
/// );
/// let exporter = Exporter::new(context, Arc::new(JsonLinesWriterFactory));
/// let report = exporter.run(Utf8Path::new("out/city.jsonl")).unwrap();
/// println!("{} objects", report.totals.total_objects());
/// ```
pub struct Exporter {
    context: TransferContext,
    writers: Arc<dyn FeatureWriterFactory>,
    predicate: Predicate,
    fetcher: Arc<dyn PayloadFetcher>,
    number_matched: bool,
    status: SessionStatus,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("context", &self.context)
            .field("predicate", &self.predicate)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Exporter {
    /// Exporter writing through `writers`, selecting every feature.
    #[must_use]
    pub fn new(context: TransferContext, writers: Arc<dyn FeatureWriterFactory>) -> Self {
        Self {
            context,
            writers,
            predicate: Predicate::All,
            fetcher: Arc::new(OfflineFetcher),
            number_matched: false,
            status: SessionStatus::default(),
        }
    }

    /// Export only features matching `predicate`.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Download remote texture images with `fetcher`.
    #[must_use]
    pub fn with_payload_fetcher(mut self, fetcher: Arc<dyn PayloadFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Report the number of matching features before each main pass.
    #[must_use]
    pub const fn with_number_matched(mut self, enabled: bool) -> Self {
        self.number_matched = enabled;
        self
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.status.get()
    }

    /// Handle cancelling a running export.
    #[must_use]
    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.context.events.cancellation_handle()
    }

    /// Export to `output`. Tiled exports write one file per tile below
    /// the folder of `output`.
    ///
    /// Returns a report with `completed == false` when the session was
    /// cancelled.
    ///
    /// # Errors
    /// Returns [`TransferError`] when a precondition fails, a resource
    /// cannot be created or a fatal error stops the session.
    pub fn run(&self, output: &Utf8Path) -> Result<ExportReport, TransferError> {
        let started = Instant::now();
        self.status.begin()?;
        let monitor = Arc::new(SessionMonitor::new());
        let handler = self.context.events.add_handler(monitor.clone());
        let result = self.export(output, &monitor, started);
        self.context.events.remove_handler(handler);
        self.status.set(SessionState::settled(
            &result.as_ref().map(|report| report.completed),
        ));
        result
    }

    fn check_preconditions(&self, output: &Utf8Path) -> Result<(), TransferError> {
        let config = &self.context.config;
        let database = &self.context.database;
        config.validate().map_err(|err| {
            TransferError::coded(ErrorCode::Configuration, "invalid export settings", err)
        })?;
        match database.workspace() {
            Some(workspace) => info!("Exporting from workspace '{workspace}'."),
            None => info!("Exporting from the default workspace."),
        }
        let tiling = config
            .tiling
            .as_ref()
            .map(TilingConfig::tiling)
            .transpose()
            .map_err(|err| TransferError::coded(ErrorCode::Configuration, "invalid tiling", err))?;
        let target_srs = tiling.as_ref().and_then(|grid| grid.srs().cloned());
        let query = Query {
            predicate: self.predicate.clone(),
            tiling,
            target_srs,
        };
        let indexed = database.spatial_index_enabled().map_err(|err| {
            TransferError::coded(ErrorCode::Database, "failed to read the spatial index status", err)
        })?;
        info!(
            "Spatial indexes are {}.",
            if indexed { "activated" } else { "not activated" }
        );
        if query.requires_spatial_index() && !indexed {
            return Err(TransferError::new(
                "spatial indexes are not activated; they are required for tiling and spatial filters",
            )
            .with_code(ErrorCode::SpatialIndexesNotActivated));
        }
        let database_srs = database.reference_system();
        if let Some(srs) = &query.target_srs {
            if srs.is_3d != database_srs.is_3d {
                return Err(TransferError::new(format!(
                    "the tiling reference system {} does not match the dimension of the database reference system {}",
                    srs.srid, database_srs.srid
                ))
                .with_code(ErrorCode::ReferenceSystemMismatch));
            }
        }
        cartage_fs::check_writable(output).map_err(|err| {
            TransferError::coded(
                ErrorCode::InvalidOutput,
                format!("cannot write to {output}"),
                err,
            )
        })
    }

    fn export(
        &self,
        output: &Utf8Path,
        monitor: &SessionMonitor,
        started: Instant,
    ) -> Result<ExportReport, TransferError> {
        self.check_preconditions(output)?;
        let resources = SessionResources::create(&self.context.config)?;
        let pass = PassContext::new(
            Arc::clone(&resources.caches),
            Arc::clone(&resources.queue),
            self.context.events.clone(),
            Arc::clone(&self.context.schema),
        );

        let mut errors = FirstError::default();
        let mut tiles = Vec::new();
        let mut resolution = ResolutionStats::default();
        if let Err(err) = self.export_files(output, &pass, monitor, &mut tiles, &mut resolution) {
            errors.record(err);
        }
        if monitor.is_fatal() {
            errors.record(interrupt_error(monitor));
        }
        let leftover = resources.teardown(&pass.events, &mut errors);
        resolution.abandon(leftover);
        errors.into_result()?;

        let totals = monitor.totals();
        if tiles.len() > 1 {
            info!("Exported objects over all tiles:");
            self.log_counters(&totals);
        }
        let elapsed = started.elapsed();
        info!("Export finished in {elapsed:.2?}.");
        Ok(ExportReport {
            completed: !monitor.is_interrupted(),
            tiles,
            totals,
            resolution,
            failed_items: monitor.failed_items(),
            elapsed,
            interrupt: monitor.interrupt().map(|event| event.message),
        })
    }

    fn export_files(
        &self,
        output: &Utf8Path,
        pass: &PassContext,
        monitor: &SessionMonitor,
        tiles: &mut Vec<TileReport>,
        resolution: &mut ResolutionStats,
    ) -> Result<(), TransferError> {
        let events = &self.context.events;
        let Some(tiling) = &self.context.config.tiling else {
            let outcome = self.export_file(output, &self.predicate, pass, monitor)?;
            resolution.merge(&outcome.resolution);
            let mut report = TileReport::new(0, 0, output.to_path_buf());
            report.counters = outcome.counters;
            tiles.push(report);
            return Ok(());
        };
        let driver = TileDriver::new(
            self.context.database.as_ref(),
            tiling,
            self.predicate.clone(),
        )?;
        let mut remaining = driver.tile_count();
        for tile in driver.tiles() {
            if monitor.is_interrupted() {
                break;
            }
            events.trigger(&SessionEvent::RemainingTiles(remaining));
            remaining = remaining.saturating_sub(1);
            events.trigger(&SessionEvent::StatusTitle(format!(
                "Exporting tile ({}, {})",
                tile.row, tile.column
            )));
            let plan = driver.plan(&tile, output);
            let outcome = plan.and_then(|planned| {
                if driver.skip(&planned)? {
                    info!("Skipping empty tile ({}, {}).", tile.row, tile.column);
                    return Ok((planned.output, None));
                }
                let exported = self.export_file(&planned.output, &planned.predicate, pass, monitor)?;
                Ok((planned.output, Some(exported)))
            });
            match outcome {
                Ok((path, None)) => {
                    let mut report = TileReport::new(tile.row, tile.column, path);
                    report.skipped = true;
                    tiles.push(report);
                }
                Ok((path, Some(exported))) => {
                    resolution.merge(&exported.resolution);
                    let mut report = TileReport::new(tile.row, tile.column, path);
                    report.counters = exported.counters;
                    tiles.push(report);
                }
                Err(err) if tiling.continue_on_tile_error && !monitor.is_fatal() => {
                    error!("Tile ({}, {}) failed: {err}", tile.row, tile.column);
                    let mut swept = FirstError::default();
                    resolution.abandon(abandon_leftovers(&pass.queue, events, &mut swept));
                    swept.into_result()?;
                    events.trigger(&SessionEvent::TileFailed {
                        row: tile.row,
                        column: tile.column,
                        message: err.to_string(),
                    });
                    let mut report = TileReport::new(tile.row, tile.column, Utf8PathBuf::new());
                    report.error = Some(err.to_string());
                    tiles.push(report);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn export_file(
        &self,
        path: &Utf8Path,
        predicate: &Predicate,
        pass: &PassContext,
        monitor: &SessionMonitor,
    ) -> Result<FileOutcome, TransferError> {
        let config = &self.context.config;
        info!("Exporting to file: {path}");
        self.context
            .events
            .trigger(&SessionEvent::StatusMessage(format!("Exporting to {path}")));
        let file = cartage_fs::create_output_file(path).map_err(|err| {
            TransferError::coded(
                ErrorCode::InvalidOutput,
                format!("failed to create {path}"),
                err,
            )
        })?;
        let writer = self.writers.open(Box::new(file.into_std())).map_err(|err| {
            TransferError::coded(
                ErrorCode::Io,
                format!("failed to open a writer for {path}"),
                err,
            )
        })?;

        let mut errors = FirstError::default();
        let written_before = pass.queue.written();
        self.status.set(SessionState::Running);
        if let Err(err) = self.main_pass(pass, &writer, predicate, monitor) {
            errors.record(err);
        }
        let mut resolution = ResolutionStats::default();
        if !errors.is_set() && !monitor.is_interrupted() {
            self.status.set(SessionState::Resolving);
            let folder = cartage_fs::payload_folder(path, &config.export.texture_folder);
            let targets = ResolverTargets {
                writer: Arc::clone(&writer),
                payloads: Arc::new(DirectoryPayloadStore::new(folder)),
                fetcher: Arc::clone(&self.fetcher),
                base_path: None,
            };
            match resolve_deferred(pass, targets, config.resolution_pool(), monitor, written_before) {
                Ok(stats) => resolution = stats,
                Err(err) => errors.record(err),
            }
        }
        errors.check(writer.close(), |err| {
            TransferError::coded(ErrorCode::Io, format!("failed to close {path}"), err)
        });
        monitor.release();
        let counters = monitor.take_tile_counters();
        self.log_counters(&counters);
        errors.into_result()?;
        Ok(FileOutcome {
            counters,
            resolution,
        })
    }

    fn main_pass(
        &self,
        pass: &PassContext,
        writer: &Arc<dyn FeatureWriter>,
        predicate: &Predicate,
        monitor: &SessionMonitor,
    ) -> Result<SplitSummary, TransferError> {
        let config = &self.context.config;
        let factory =
            ExportWorkerFactory::new(pass.clone(), Arc::clone(writer), config.export.clone());
        let pool = start_pool(
            "export",
            config.main_pool(),
            SizingStrategy::Aggressive,
            Arc::new(factory),
            &self.context.events,
            monitor,
        )?;
        let splitter = QuerySplitter::new(self.context.database.as_ref(), &pool, &self.context.events)
            .with_number_matched(self.number_matched);
        monitor.register_splitter(splitter.handle());
        let split = splitter.run(predicate);
        let healthy = split.is_ok() && !monitor.is_interrupted();
        let finished = finish_pool(&pool, healthy);
        let summary = split?;
        finished?;
        debug!(
            "submitted {} features, skipped {}; peak pool size {}",
            summary.submitted,
            summary.skipped,
            pool.peak_size()
        );
        Ok(summary)
    }

    fn log_counters(&self, counters: &Counters) {
        for (type_id, count) in &counters.objects {
            info!("{}: {count}", self.context.type_name(*type_id));
        }
        for (class, count) in &counters.geometries {
            info!("{class}: {count}");
        }
        info!(
            "Processed {} objects and {} geometries.",
            counters.total_objects(),
            counters.total_geometries()
        );
    }
}

#[cfg(test)]
mod tests;
