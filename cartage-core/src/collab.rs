//! Contracts of the collaborators consumed by the transfer engine.
//!
//! The engine never talks to a concrete database, encoder or file format.
//! Adapters implementing these traits live in `cartage-data` or in the
//! embedding application.

use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;

use geo::Rect;
use thiserror::Error;

use crate::filter::{Predicate, ReferenceSystem};
use crate::model::{Feature, FeatureTypeId, InternalKey, ResolvedReference, SourceFeature};

/// Boxed error used at collaborator seams.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Errors reported by a [`DatabaseAdapter`] or [`KeyAllocator`].
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A query could not be executed.
    #[error("database query failed: {message}")]
    Query {
        /// Query description.
        message: String,
        /// Driver error.
        #[source]
        source: BoxError,
    },
    /// An extent could not be transformed between reference systems.
    #[error("cannot transform extent from SRID {from} to SRID {to}")]
    Transform {
        /// Source SRID.
        from: u32,
        /// Target SRID.
        to: u32,
    },
    /// A row could not be decoded into a feature.
    #[error("invalid feature row {key}: {message}")]
    InvalidRow {
        /// Key of the offending row.
        key: i64,
        /// Decoding failure.
        message: String,
    },
}

/// Errors reported by a [`FeatureWriter`].
#[derive(Debug, Error)]
pub enum WriteError {
    /// The output stream failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
    /// A feature could not be encoded.
    #[error("failed to encode feature: {message}")]
    Encode {
        /// Encoding failure.
        message: String,
    },
    /// The writer was used after `close`.
    #[error("writer is closed")]
    Closed,
    /// The database sink rejected the feature.
    #[error("database sink failed: {source}")]
    Sink {
        /// Sink error.
        #[source]
        source: BoxError,
    },
}

/// Errors reported by a [`FeatureReader`].
#[derive(Debug, Error)]
pub enum ReadError {
    /// The input stream failed.
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    /// A record could not be decoded.
    #[error("invalid record at line {line}: {message}")]
    Decode {
        /// One-based line number.
        line: usize,
        /// Decoding failure.
        message: String,
    },
}

/// Errors raised while fetching or storing binary payloads.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// A local payload could not be read.
    #[error("failed to read payload {location}: {source}")]
    Read {
        /// Path of the payload.
        location: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The payload had no content.
    #[error("payload {location} is empty")]
    Empty {
        /// Location of the payload.
        location: String,
    },
    /// A remote payload could not be fetched.
    #[error("failed to fetch {url}: {message}")]
    Remote {
        /// Requested URL.
        url: String,
        /// Transport failure.
        message: String,
    },
    /// The location could not be interpreted.
    #[error("invalid payload location {location}: {message}")]
    InvalidLocation {
        /// Offending location.
        location: String,
        /// Reason.
        message: String,
    },
    /// The payload could not be stored.
    #[error("failed to store payload {name}: {source}")]
    Store {
        /// Target name.
        name: String,
        /// Storage error.
        #[source]
        source: BoxError,
    },
}

/// Lazily produced sequence of selected features.
pub type FeatureRows<'a> = Box<dyn Iterator<Item = Result<Feature, DatabaseError>> + 'a>;

/// Database access used by the exporter.
pub trait DatabaseAdapter: Send + Sync {
    /// Whether spatial indexes are active.
    ///
    /// # Errors
    /// Returns [`DatabaseError`] when the index status cannot be queried.
    fn spatial_index_enabled(&self) -> Result<bool, DatabaseError>;

    /// Reference system of the stored geometries.
    fn reference_system(&self) -> ReferenceSystem;

    /// Name of the database workspace in use, if the database versions data.
    fn workspace(&self) -> Option<String> {
        None
    }

    /// Count the features matching `predicate`.
    ///
    /// # Errors
    /// Returns [`DatabaseError`] when the query fails.
    fn count(&self, predicate: &Predicate) -> Result<u64, DatabaseError>;

    /// Stream the features matching `predicate`.
    ///
    /// # Errors
    /// Returns [`DatabaseError`] when the query cannot be started; row
    /// failures are reported through the iterator.
    fn select(&self, predicate: &Predicate) -> Result<FeatureRows<'_>, DatabaseError>;

    /// Transform `extent` from the `from` reference system into the
    /// database's.
    ///
    /// # Errors
    /// The default implementation only accepts an identical SRID and returns
    /// [`DatabaseError::Transform`] otherwise.
    fn transform_extent(
        &self,
        extent: Rect<f64>,
        from: &ReferenceSystem,
    ) -> Result<Rect<f64>, DatabaseError> {
        let to = self.reference_system().srid;
        if from.srid == to {
            Ok(extent)
        } else {
            Err(DatabaseError::Transform {
                from: from.srid,
                to,
            })
        }
    }
}

/// Thread-safe sink for converted features.
///
/// Workers call [`write`](Self::write) and [`apply`](Self::apply)
/// concurrently; the controller calls [`close`](Self::close) exactly once.
pub trait FeatureWriter: Send + Sync {
    /// Write one feature.
    ///
    /// # Errors
    /// Returns [`WriteError`] when the feature cannot be encoded or written.
    fn write(&self, feature: &Feature) -> Result<(), WriteError>;

    /// Apply a reference resolved during the resolution pass.
    ///
    /// # Errors
    /// Returns [`WriteError`] when the patch cannot be written.
    fn apply(&self, reference: &ResolvedReference) -> Result<(), WriteError>;

    /// Flush and release the underlying stream.
    ///
    /// # Errors
    /// Returns [`WriteError`] when flushing fails.
    fn close(&self) -> Result<(), WriteError>;
}

/// Opens [`FeatureWriter`]s over output streams.
pub trait FeatureWriterFactory: Send + Sync {
    /// Wrap `stream` in a writer.
    ///
    /// # Errors
    /// Returns [`WriteError`] when the writer cannot be initialised.
    fn open(&self, stream: Box<dyn Write + Send>) -> Result<Arc<dyn FeatureWriter>, WriteError>;
}

/// Source of features for an import session.
pub trait FeatureReader: Iterator<Item = Result<SourceFeature, ReadError>> {}

impl<I> FeatureReader for I where I: Iterator<Item = Result<SourceFeature, ReadError>> {}

/// Schema metadata consulted for logging and classification.
pub trait SchemaMapping: Send + Sync {
    /// Human-readable name of a feature type.
    fn type_name(&self, type_id: FeatureTypeId) -> Option<String>;

    /// Whether features of this type group other features.
    fn is_group_type(&self, type_id: FeatureTypeId) -> bool {
        let _ = type_id;
        false
    }
}

/// Destination of binary payloads such as texture images.
///
/// Each call is its own unit of work: a failure must not affect payloads
/// stored earlier.
pub trait PayloadStore: Send + Sync {
    /// Store `bytes` under `name` for the feature `owner`.
    ///
    /// # Errors
    /// Returns [`PayloadError::Store`] when the payload cannot be persisted.
    fn store(&self, owner: InternalKey, name: &str, bytes: &[u8]) -> Result<(), PayloadError>;
}

/// Retrieves remote payloads.
pub trait PayloadFetcher: Send + Sync {
    /// Download the payload at `url`.
    ///
    /// # Errors
    /// Returns [`PayloadError::Remote`] on transport failures.
    fn fetch_remote(&self, url: &str) -> Result<Vec<u8>, PayloadError>;
}

/// Assigns internal keys to imported features.
pub trait KeyAllocator: Send + Sync {
    /// Allocate the next key.
    ///
    /// # Errors
    /// Returns [`DatabaseError`] when the key sequence cannot be advanced.
    fn next_key(&self) -> Result<InternalKey, DatabaseError>;
}
