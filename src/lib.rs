//! Facade crate for the Cartage transfer engine.
//!
//! This crate re-exports the core domain types and, behind the `engine`
//! feature, the cache layer and the transfer controllers.

#![forbid(unsafe_code)]

pub use cartage_core::{
    Counters, DatabaseAdapter, EventDispatcher, ExternalId, Feature, FeatureReader,
    FeatureTypeId, FeatureWriter, FeatureWriterFactory, GeometryClass, InternalKey, Predicate,
    SchemaMapping, SessionEvent, Tile, Tiling, TransferConfig,
};
pub use cartage_core::pool::{PoolError, PoolSettings, WorkerPool};

#[cfg(feature = "engine")]
pub use cartage_data::{CacheTableStore, DeferredQueue, DeferredReference, IdCache};

#[cfg(feature = "engine")]
pub use cartage_engine::{
    ExportReport, Exporter, ImportReport, Importer, SessionState, TransferContext, TransferError,
};
