//! Splitting drivers: turn a query result or an input file into work items.
//!
//! Export reads the features matching a predicate from the database and
//! submits one [`Feature`] per item. Import reads source features, assigns
//! their external ids and submits one [`ImportItem`] per item. Both stop
//! producing as soon as their [`SplitterHandle`] is shut down or the pool
//! refuses work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cartage_core::pool::{PoolError, WorkerPool};
use cartage_core::{
    DatabaseAdapter, EventDispatcher, ExternalId, Feature, FeatureReader, IdHandling, IdMode,
    Predicate, ReadError, SessionEvent, SourceFeature,
};
use log::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, TransferError};

mod tiles;

pub use tiles::{TileDriver, TilePlan};

/// Attribute keeping the original id of a feature whose id was replaced.
pub const ORIGINAL_ID_ATTRIBUTE: &str = "original_id";

/// Stop flag shared between a splitter and the interrupt path.
#[derive(Debug, Clone, Default)]
pub struct SplitterHandle(Arc<AtomicBool>);

impl SplitterHandle {
    /// Ask the splitter to stop producing work.
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one splitting run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitSummary {
    /// Items handed to the pool.
    pub submitted: u64,
    /// Records skipped because they could not be read or were invalid.
    pub skipped: u64,
    /// Whether production stopped early.
    pub stopped: bool,
}

fn pool_refused(err: PoolError) -> Result<(), TransferError> {
    match err {
        PoolError::Closed { pool } => {
            debug!("pool {pool} closed, stopping production");
            Ok(())
        }
        other => Err(TransferError::coded(
            ErrorCode::Aborted,
            "failed to submit work",
            other,
        )),
    }
}

fn report_item_failure(events: &EventDispatcher, external_id: Option<ExternalId>, message: String) {
    warn!("{message}");
    events.trigger(&SessionEvent::ItemFailed {
        external_id,
        message,
    });
}

/// Submits every database feature matching a predicate to the main pool.
pub struct QuerySplitter<'a> {
    database: &'a dyn DatabaseAdapter,
    pool: &'a WorkerPool<Feature>,
    events: &'a EventDispatcher,
    number_matched: bool,
    handle: SplitterHandle,
}

impl<'a> QuerySplitter<'a> {
    /// Splitter feeding `pool` from `database`.
    #[must_use]
    pub fn new(
        database: &'a dyn DatabaseAdapter,
        pool: &'a WorkerPool<Feature>,
        events: &'a EventDispatcher,
    ) -> Self {
        Self {
            database,
            pool,
            events,
            number_matched: false,
            handle: SplitterHandle::default(),
        }
    }

    /// Count the matching features first and report the count as a
    /// [`SessionEvent::NumberMatched`] event.
    #[must_use]
    pub const fn with_number_matched(mut self, enabled: bool) -> Self {
        self.number_matched = enabled;
        self
    }

    /// Handle stopping this splitter.
    #[must_use]
    pub fn handle(&self) -> SplitterHandle {
        self.handle.clone()
    }

    /// Submit every feature matching `predicate`.
    ///
    /// Rows the database cannot decode are reported and skipped.
    ///
    /// # Errors
    /// Returns [`TransferError`] when the query fails or the pool fails
    /// for a reason other than being closed.
    pub fn run(&self, predicate: &Predicate) -> Result<SplitSummary, TransferError> {
        let query_failed =
            |err| TransferError::coded(ErrorCode::Database, "failed to query features", err);
        if self.number_matched {
            let matched = self.database.count(predicate).map_err(query_failed)?;
            debug!("{matched} features match the query");
            self.events.trigger(&SessionEvent::NumberMatched(matched));
        }
        let rows = self.database.select(predicate).map_err(query_failed)?;
        let mut summary = SplitSummary::default();
        for row in rows {
            if self.handle.is_stopped() {
                summary.stopped = true;
                break;
            }
            match row {
                Ok(feature) => {
                    if let Err(err) = self.pool.submit(feature) {
                        pool_refused(err)?;
                        summary.stopped = true;
                        break;
                    }
                    summary.submitted += 1;
                }
                Err(err) => {
                    summary.skipped += 1;
                    report_item_failure(self.events, None, format!("skipping feature: {err}"));
                }
            }
        }
        Ok(summary)
    }
}

/// Source feature whose external id has been settled.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportItem {
    /// Id under which the feature is imported.
    pub external_id: ExternalId,
    /// Id the feature was read with, when it was replaced.
    pub original_id: Option<ExternalId>,
    /// The feature as read.
    pub source: SourceFeature,
}

/// Submits the features of an input reader to the import pool.
pub struct ReaderSplitter<'a> {
    pool: &'a WorkerPool<ImportItem>,
    events: &'a EventDispatcher,
    id_handling: &'a IdHandling,
    handle: SplitterHandle,
}

impl<'a> ReaderSplitter<'a> {
    /// Splitter feeding `pool`, assigning ids per `id_handling`.
    #[must_use]
    pub fn new(
        pool: &'a WorkerPool<ImportItem>,
        events: &'a EventDispatcher,
        id_handling: &'a IdHandling,
    ) -> Self {
        Self {
            pool,
            events,
            id_handling,
            handle: SplitterHandle::default(),
        }
    }

    /// Handle stopping this splitter.
    #[must_use]
    pub fn handle(&self) -> SplitterHandle {
        self.handle.clone()
    }

    fn generate_id(&self) -> Result<ExternalId, String> {
        ExternalId::new(format!("{}{}", self.id_handling.prefix, Uuid::new_v4()))
            .map_err(|err| err.to_string())
    }

    /// Validate `source` and settle its external id.
    ///
    /// [`IdMode::Complement`] generates an id only for features without
    /// one; [`IdMode::Replace`] always generates one and keeps the
    /// original under [`ORIGINAL_ID_ATTRIBUTE`] and in
    /// [`ImportItem::original_id`], so references using it still resolve.
    ///
    /// # Errors
    /// Returns a message when the feature has no finite envelope.
    pub fn prepare(&self, mut source: SourceFeature) -> Result<ImportItem, String> {
        if !source.has_finite_envelope() {
            let name = source
                .external_id
                .as_ref()
                .map_or_else(|| "without id".to_owned(), ToString::to_string);
            return Err(format!("feature {name} has no finite envelope"));
        }
        let read_id = source.external_id.clone();
        let (external_id, original_id) = match (self.id_handling.mode, read_id) {
            (IdMode::Complement, Some(id)) => (id, None),
            (IdMode::Complement, None) => (self.generate_id()?, None),
            (IdMode::Replace, original) => {
                if let Some(id) = &original {
                    source
                        .attributes
                        .insert(ORIGINAL_ID_ATTRIBUTE.to_owned(), id.to_string());
                }
                (self.generate_id()?, original)
            }
        };
        Ok(ImportItem {
            external_id,
            original_id,
            source,
        })
    }

    /// Submit every feature read from `reader`.
    ///
    /// Records that cannot be decoded or validated are reported and
    /// skipped.
    ///
    /// # Errors
    /// Returns [`TransferError`] when reading the input fails or the pool
    /// fails for a reason other than being closed.
    pub fn run<R: FeatureReader>(&self, reader: R) -> Result<SplitSummary, TransferError> {
        let mut summary = SplitSummary::default();
        for record in reader {
            if self.handle.is_stopped() {
                summary.stopped = true;
                break;
            }
            let source = match record {
                Ok(source) => source,
                Err(err @ ReadError::Decode { .. }) => {
                    summary.skipped += 1;
                    report_item_failure(self.events, None, err.to_string());
                    continue;
                }
                Err(err @ ReadError::Io(_)) => {
                    return Err(TransferError::coded(
                        ErrorCode::Io,
                        "failed to read the input",
                        err,
                    ));
                }
            };
            let original = source.external_id.clone();
            match self.prepare(source) {
                Ok(item) => {
                    if let Err(err) = self.pool.submit(item) {
                        pool_refused(err)?;
                        summary.stopped = true;
                        break;
                    }
                    summary.submitted += 1;
                }
                Err(message) => {
                    summary.skipped += 1;
                    report_item_failure(self.events, original, message);
                }
            }
        }
        Ok(summary)
    }
}
