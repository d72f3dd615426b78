//! Core domain types for the Cartage transfer engine.
//!
//! This crate holds the feature model, selection predicates and tiling,
//! session events, the contracts of external collaborators, session
//! configuration and the generic [`pool::WorkerPool`]. It has no knowledge
//! of concrete storage; see `cartage-data` for cache tables and reference
//! adapters.

#![forbid(unsafe_code)]

pub mod collab;
pub mod config;
pub mod event;
pub mod filter;
pub mod model;
pub mod pool;
pub mod tiling;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use collab::{
    BoxError, DatabaseAdapter, DatabaseError, FeatureReader, FeatureRows, FeatureWriter,
    FeatureWriterFactory, KeyAllocator, PayloadError, PayloadFetcher, PayloadStore, ReadError,
    SchemaMapping, WriteError,
};
pub use config::{
    BatchConfig, CacheSizing, ConfigError, ExportOptions, IdCacheConfig, IdHandling, IdMode,
    ImportLogConfig, ImportLogMode, ImportOptions, ThreadPoolConfig, TilingConfig,
    TransferConfig,
};
pub use event::{
    CancellationHandle, EventDispatcher, EventHandler, HandlerId, InterruptEvent, SessionEvent,
};
pub use filter::{Predicate, Query, ReferenceSystem, TileFilter};
pub use model::{
    Counters, DeferredKind, ExternalId, Feature, FeatureReference, FeatureTypeId, GeometryClass,
    InternalKey, ModelError, ReferenceKind, ResolvedReference, SourceFeature, TextureReference,
};
pub use tiling::{Tile, TileNameSuffixMode, TileSuffixMode, Tiling, TilingError};
