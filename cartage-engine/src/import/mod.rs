//! Import controller.
//!
//! Reads source features, assigns ids and keys, stores them through the
//! database sink and resolves the references they carry once every
//! feature is known.

use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use cartage_core::pool::SizingStrategy;
use cartage_core::{
    CancellationHandle, Counters, ExternalId, FeatureReader, FeatureWriter, ImportLogMode,
    InternalKey, KeyAllocator, PayloadFetcher, PayloadStore,
};
use cartage_data::OfflineFetcher;
use log::{debug, info};
use parking_lot::Mutex;

use crate::context::TransferContext;
use crate::error::{ErrorCode, FirstError, TransferError};
use crate::resolver::{ResolutionStats, ResolverTargets, resolve_deferred};
use crate::session::{
    SessionMonitor, SessionResources, SessionState, SessionStatus, finish_pool, start_pool,
};
use crate::splitter::{ReaderSplitter, SplitSummary};
use crate::worker::{ImportWorkerFactory, PassContext};

/// Log listing every imported feature as `type_name,external_id,key`.
#[derive(Debug)]
pub struct ImportLog {
    path: Utf8PathBuf,
    out: Mutex<BufWriter<std::fs::File>>,
    entries: AtomicU64,
}

impl ImportLog {
    /// Open the log at `path` following `mode`. A header line is written
    /// when the file is empty.
    ///
    /// # Errors
    /// Returns the IO error raised while opening or writing the file.
    pub fn open(path: &Utf8Path, mode: ImportLogMode) -> io::Result<Self> {
        let (opened, handle) = cartage_fs::open_import_log(path, mode)?;
        let file = handle.into_std();
        let empty = file.metadata()?.len() == 0;
        let mut out = BufWriter::new(file);
        if empty {
            writeln!(out, "type_name,external_id,key")?;
        }
        Ok(Self {
            path: opened,
            out: Mutex::new(out),
            entries: AtomicU64::new(0),
        })
    }

    /// Path of the file actually written.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Lines recorded so far.
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }

    /// Append one line.
    ///
    /// # Errors
    /// Returns the IO error raised while writing.
    pub fn record(&self, type_name: &str, id: &ExternalId, key: InternalKey) -> io::Result<()> {
        writeln!(self.out.lock(), "{type_name},{id},{key}")?;
        self.entries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Flush buffered lines.
    ///
    /// # Errors
    /// Returns the IO error raised while flushing.
    pub fn flush(&self) -> io::Result<()> {
        self.out.lock().flush()
    }
}

/// Result of an import session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// Whether the whole input was processed.
    pub completed: bool,
    /// Imported objects and geometries.
    pub counters: Counters,
    /// Outcome of the resolution pass.
    pub resolution: ResolutionStats,
    /// Features handed to the import workers.
    pub submitted: u64,
    /// Records skipped while reading.
    pub skipped: u64,
    /// Items skipped because of per-item failures.
    pub failed_items: u64,
    /// Import log written, if enabled.
    pub log_file: Option<Utf8PathBuf>,
    /// Wall-clock duration of the session.
    pub elapsed: Duration,
    /// Message of the interrupt that stopped the session.
    pub interrupt: Option<String>,
}

fn utf8_path(path: &std::path::Path, what: &str) -> Result<Utf8PathBuf, TransferError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|raw| {
        TransferError::new(format!("the {what} {} is not valid UTF-8", raw.display()))
            .with_code(ErrorCode::Configuration)
    })
}

/// Imports features into a database sink.
///
/// # Examples
/// ```no_run
/// use std::sync::Arc;
///
/// use cartage_core::TransferConfig;
/// use cartage_core::test_support::StaticSchemaMapping;
/// use cartage_data::{JsonLinesReader, SqliteFeatureStore};
/// use cartage_engine::{Importer, TransferContext};
///
/// let store = Arc::new(SqliteFeatureStore::open("city.sqlite").unwrap());
/// let context = TransferContext::new(
///     TransferConfig::default(),
///     store.clone(),
///     Arc::new(StaticSchemaMapping::new()),
/// );
/// let input = std::io::BufReader::new(std::fs::File::open("city.jsonl").unwrap());
/// let report = Importer::new(context)
///     .run(JsonLinesReader::new(input), store)
///     .unwrap();
/// assert!(report.completed);
/// ```
pub struct Importer {
    context: TransferContext,
    fetcher: Arc<dyn PayloadFetcher>,
    status: SessionStatus,
}

impl std::fmt::Debug for Importer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Importer")
            .field("context", &self.context)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Importer {
    /// Importer over `context`. Remote texture images are not fetched
    /// unless a fetcher is supplied.
    #[must_use]
    pub fn new(context: TransferContext) -> Self {
        Self {
            context,
            fetcher: Arc::new(OfflineFetcher),
            status: SessionStatus::default(),
        }
    }

    /// Download remote texture images with `fetcher`.
    #[must_use]
    pub fn with_payload_fetcher(mut self, fetcher: Arc<dyn PayloadFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.status.get()
    }

    /// Handle cancelling a running import.
    #[must_use]
    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.context.events.cancellation_handle()
    }

    /// Import every feature of `reader` into `sink`.
    ///
    /// Returns a report with `completed == false` when the session was
    /// cancelled.
    ///
    /// # Errors
    /// Returns [`TransferError`] when a precondition fails, a resource
    /// cannot be created or a fatal error stops the session.
    pub fn run<R, S>(&self, reader: R, sink: Arc<S>) -> Result<ImportReport, TransferError>
    where
        R: FeatureReader,
        S: FeatureWriter + KeyAllocator + PayloadStore + 'static,
    {
        let started = Instant::now();
        self.status.begin()?;
        let monitor = Arc::new(SessionMonitor::new());
        let handler = self.context.events.add_handler(monitor.clone());
        let result = self.import(reader, sink, &monitor, started);
        self.context.events.remove_handler(handler);
        self.status.set(SessionState::settled(
            &result.as_ref().map(|report| report.completed),
        ));
        result
    }

    fn open_log(&self) -> Result<Option<Arc<ImportLog>>, TransferError> {
        let settings = &self.context.config.import.log;
        if !settings.enabled {
            return Ok(None);
        }
        let Some(file) = &settings.file else {
            return Err(TransferError::new("no import log file was given")
                .with_code(ErrorCode::InvalidOutput));
        };
        let path = utf8_path(file, "import log file")?;
        let log = ImportLog::open(&path, settings.mode).map_err(|err| {
            TransferError::coded(
                ErrorCode::InvalidOutput,
                format!("failed to open the import log {path}"),
                err,
            )
        })?;
        info!("Writing import log to {}.", log.path());
        Ok(Some(Arc::new(log)))
    }

    fn import<R, S>(
        &self,
        reader: R,
        sink: Arc<S>,
        monitor: &SessionMonitor,
        started: Instant,
    ) -> Result<ImportReport, TransferError>
    where
        R: FeatureReader,
        S: FeatureWriter + KeyAllocator + PayloadStore + 'static,
    {
        let config = &self.context.config;
        config.validate().map_err(|err| {
            TransferError::coded(ErrorCode::Configuration, "invalid import settings", err)
        })?;
        if let Some(workspace) = self.context.database.workspace() {
            info!("Importing into workspace '{workspace}'.");
        }
        let base_path = config
            .import
            .base_path
            .as_deref()
            .map(|path| utf8_path(path, "import base path"))
            .transpose()?;
        let log = self.open_log()?;
        let resources = SessionResources::create(config)?;
        let pass = PassContext::new(
            Arc::clone(&resources.caches),
            Arc::clone(&resources.queue),
            self.context.events.clone(),
            Arc::clone(&self.context.schema),
        );

        let mut errors = FirstError::default();
        self.status.set(SessionState::Running);
        let writer: Arc<dyn FeatureWriter> = sink.clone();
        let keys: Arc<dyn KeyAllocator> = sink.clone();
        let main = self.main_pass(reader, &pass, writer.clone(), keys, log.clone(), monitor);
        let summary = main.unwrap_or_else(|err| {
            errors.record(err);
            SplitSummary::default()
        });
        let mut resolution = ResolutionStats::default();
        if !errors.is_set() && !monitor.is_interrupted() {
            self.status.set(SessionState::Resolving);
            let targets = ResolverTargets {
                writer: writer.clone(),
                payloads: sink.clone(),
                fetcher: Arc::clone(&self.fetcher),
                base_path,
            };
            match resolve_deferred(&pass, targets, config.resolution_pool(), monitor, 0) {
                Ok(stats) => resolution = stats,
                Err(err) => errors.record(err),
            }
        }
        if monitor.is_fatal() {
            errors.record(interrupt_error(monitor));
        }
        errors.check(writer.close(), |err| {
            TransferError::coded(ErrorCode::Database, "failed to close the database sink", err)
        });
        if let Some(log) = &log {
            errors.check(log.flush(), |err| {
                TransferError::coded(ErrorCode::Io, "failed to write the import log", err)
            });
        }
        monitor.release();
        resolution.abandon(resources.teardown(&pass.events, &mut errors));
        errors.into_result()?;

        let counters = monitor.take_tile_counters();
        for (type_id, count) in &counters.objects {
            info!("Imported {}: {count}", self.context.type_name(*type_id));
        }
        info!("Imported geometries: {}", counters.total_geometries());
        let elapsed = started.elapsed();
        info!("Import finished in {elapsed:.2?}.");
        Ok(ImportReport {
            completed: !monitor.is_interrupted(),
            counters,
            resolution,
            submitted: summary.submitted,
            skipped: summary.skipped,
            failed_items: monitor.failed_items(),
            log_file: log.map(|log| log.path().to_path_buf()),
            elapsed,
            interrupt: monitor.interrupt().map(|event| event.message),
        })
    }

    fn main_pass<R: FeatureReader>(
        &self,
        reader: R,
        pass: &PassContext,
        sink: Arc<dyn FeatureWriter>,
        keys: Arc<dyn KeyAllocator>,
        log: Option<Arc<ImportLog>>,
        monitor: &SessionMonitor,
    ) -> Result<SplitSummary, TransferError> {
        let config = &self.context.config;
        let factory = ImportWorkerFactory::new(pass.clone(), sink, keys, log);
        let pool = start_pool(
            "import",
            config.main_pool(),
            SizingStrategy::Aggressive,
            Arc::new(factory),
            &self.context.events,
            monitor,
        )?;
        let splitter =
            ReaderSplitter::new(&pool, &self.context.events, &config.import.id_handling);
        monitor.register_splitter(splitter.handle());
        let split = splitter.run(reader);
        let healthy = split.is_ok() && !monitor.is_interrupted();
        let finished = finish_pool(&pool, healthy);
        let summary = split?;
        finished?;
        debug!(
            "submitted {} features, skipped {}",
            summary.submitted, summary.skipped
        );
        Ok(summary)
    }
}

/// Error describing the fatal interrupt recorded by `monitor`.
pub(crate) fn interrupt_error(monitor: &SessionMonitor) -> TransferError {
    let Some(event) = monitor.interrupt() else {
        return TransferError::new("the session was aborted").with_code(ErrorCode::Aborted);
    };
    let error = TransferError::new(event.message).with_code(ErrorCode::Aborted);
    match event.cause {
        Some(cause) => error.with_cause(cause),
        None => error,
    }
}

#[cfg(test)]
mod tests;
