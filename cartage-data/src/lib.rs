//! Storage and I/O collaborators for the Cartage transfer engine.
//!
//! Responsibilities:
//! - Session-scoped cache tables backing the id caches and deferred queues.
//! - Binary payload resolution for texture images.
//! - Reference collaborators: a SQLite feature database and JSON-lines
//!   feature files.
//!
//! Boundaries:
//! - Do not schedule work; pools and passes live in `cartage-engine`.
//! - Domain types and collaborator traits come from `cartage-core`.
//!
//! Invariants:
//! - Every type shared between workers is `Send + Sync`.
//! - Cache tables never outlive their [`CacheTableStore`].
#![forbid(unsafe_code)]

pub mod cache;
pub mod deferred;
pub mod id_cache;
pub mod jsonl;
pub mod payload;
pub mod sqlite;

pub use cache::{CacheError, CacheTable, CacheTableModel, CacheTableStore, IdCacheKind};
pub use deferred::{
    DeferredGroup, DeferredQueue, DeferredQueueError, DeferredReference, StoredReference,
    StreamError,
};
pub use id_cache::{IdCache, IdCacheEntry, IdCacheManager, IdCacheStats, InsertOutcome};
pub use jsonl::{JsonLinesReader, JsonLinesWriter, JsonLinesWriterFactory};
pub use payload::{
    DirectoryPayloadStore, HttpPayloadFetcher, OfflineFetcher, PayloadLocation, load_payload,
};
pub use sqlite::{SqliteFeatureStore, SqliteStoreError, StoredLink};
