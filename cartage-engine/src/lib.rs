//! Transfer controllers for the Cartage engine.
//!
//! Responsibilities:
//! - Export features from a database to files, optionally tile by tile.
//! - Import features from a reader into a database sink.
//! - Defer references whose targets are unknown during the main pass and
//!   resolve them in a second pass.
//!
//! Boundaries:
//! - Collaborator traits and domain types come from `cartage-core`.
//! - Cache tables, deferred queues and payload handling come from
//!   `cartage-data`.
//!
//! Invariants:
//! - At most one session runs per controller.
//! - Every pool, writer and cache table a session creates is released when
//!   the session ends, whatever its outcome.
//! - The first error raised during teardown is reported; later ones are
//!   logged.
#![forbid(unsafe_code)]

mod context;
mod error;
mod export;
mod import;
mod resolver;
mod session;
mod splitter;
mod worker;

pub use context::TransferContext;
pub use error::{ErrorCode, TransferError};
pub use export::{ExportReport, Exporter, TileReport};
pub use import::{ImportLog, ImportReport, Importer};
pub use resolver::{
    ResolutionDriver, ResolutionStats, ResolutionTally, ResolverTargets, ResolverWorker,
    ResolverWorkerFactory, sweep,
};
pub use session::{SessionMonitor, SessionState, SessionStatus};
pub use splitter::{
    ImportItem, ORIGINAL_ID_ATTRIBUTE, QuerySplitter, ReaderSplitter, SplitSummary,
    SplitterHandle, TileDriver, TilePlan,
};
pub use worker::{
    ExportWorker, ExportWorkerFactory, ImportWorker, ImportWorkerFactory, PassContext,
    WriteLedger, defer,
};
