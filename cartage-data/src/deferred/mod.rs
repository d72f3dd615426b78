//! Deferred reference queues.
//!
//! Workers record references whose target is not known yet. Each
//! [`DeferredKind`] has its own buffered queue backed by a cache table;
//! the resolution pass streams the records back grouped by source key, in
//! the order they were written.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cartage_core::{DeferredKind, ExternalId, InternalKey};
use log::debug;
use parking_lot::Mutex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheError, CacheTable, CacheTableModel, CacheTableStore};

/// Rows fetched per page while streaming a queue.
const STREAM_PAGE: usize = 512;

/// Errors raised by [`DeferredQueue`].
#[derive(Debug, Error)]
pub enum DeferredQueueError {
    /// The backing table failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// A record could not be serialised.
    #[error("failed to encode deferred {kind} record: {source}")]
    Encode {
        /// Queue of the record.
        kind: DeferredKind,
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// A stored record could not be decoded.
    #[error("failed to decode deferred {kind} record {seq}: {source}")]
    Decode {
        /// Queue of the record.
        kind: DeferredKind,
        /// Sequence number of the record.
        seq: i64,
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
}

/// A reference to patch once its target is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferredReference {
    /// Membership of `member` in `group`, or `group`'s parent when
    /// `is_parent` is set.
    GroupMember {
        /// Key of the group feature.
        group: InternalKey,
        /// External id of the member or parent.
        member: ExternalId,
        /// Optional membership role.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        /// Whether the target is the group's parent.
        #[serde(default)]
        is_parent: bool,
    },
    /// Link from `source` to `target`.
    FeatureLink {
        /// Key of the linking feature.
        source: InternalKey,
        /// External id of the linked feature.
        target: ExternalId,
        /// Optional link role.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    /// Binding of a surface to a texture.
    TextureBinding {
        /// Key of the feature owning the surface.
        surface: InternalKey,
        /// External id of the texture.
        texture: ExternalId,
    },
    /// Image to fetch and store for `owner`.
    TextureImage {
        /// Key of the feature referencing the image.
        owner: InternalKey,
        /// Remote URL or local path of the image.
        uri: String,
    },
}

impl DeferredReference {
    /// Queue this record belongs to.
    #[must_use]
    pub const fn kind(&self) -> DeferredKind {
        match self {
            Self::GroupMember { .. } => DeferredKind::GroupMember,
            Self::FeatureLink { .. } => DeferredKind::FeatureLink,
            Self::TextureBinding { .. } => DeferredKind::TextureBinding,
            Self::TextureImage { .. } => DeferredKind::TextureImage,
        }
    }

    /// Key of the feature to patch.
    #[must_use]
    pub const fn source_key(&self) -> InternalKey {
        match self {
            Self::GroupMember { group, .. } => *group,
            Self::FeatureLink { source, .. } => *source,
            Self::TextureBinding { surface, .. } => *surface,
            Self::TextureImage { owner, .. } => *owner,
        }
    }

    /// External id or location of the target.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::GroupMember { member, .. } => member.as_str(),
            Self::FeatureLink { target, .. } => target.as_str(),
            Self::TextureBinding { texture, .. } => texture.as_str(),
            Self::TextureImage { uri, .. } => uri,
        }
    }
}

/// A record read back from its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReference {
    /// Write order within the queue.
    pub seq: i64,
    /// The record.
    pub reference: DeferredReference,
}

/// Records of one kind sharing a source key, in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredGroup {
    /// Queue of the records.
    pub kind: DeferredKind,
    /// Key of the feature the records patch.
    pub source: InternalKey,
    /// Records in write order.
    pub records: Vec<StoredReference>,
}

impl DeferredGroup {
    /// Sequence numbers of every record in the group.
    #[must_use]
    pub fn seqs(&self) -> Vec<i64> {
        self.records.iter().map(|record| record.seq).collect()
    }
}

struct Lane {
    table: Arc<CacheTable>,
    buffer: Mutex<Vec<DeferredReference>>,
}

/// Typed, batched queues of deferred references.
///
/// # Examples
/// ```
/// use cartage_core::{DeferredKind, ExternalId, InternalKey};
/// use cartage_data::cache::CacheTableStore;
/// use cartage_data::deferred::{DeferredQueue, DeferredReference};
///
/// let store = CacheTableStore::create(None).unwrap();
/// let queue = DeferredQueue::new(&store, 20).unwrap();
/// queue
///     .enqueue(DeferredReference::FeatureLink {
///         source: InternalKey::new(1),
///         target: ExternalId::new("BLDG_2").unwrap(),
///         role: None,
///     })
///     .unwrap();
/// queue.flush().unwrap();
/// let mut groups = Vec::new();
/// queue
///     .stream(DeferredKind::FeatureLink, |group| {
///         groups.push(group);
///         Ok::<_, std::convert::Infallible>(())
///     })
///     .unwrap();
/// assert_eq!(groups.len(), 1);
/// assert_eq!(queue.written(), 1);
/// ```
pub struct DeferredQueue {
    lanes: BTreeMap<DeferredKind, Lane>,
    batch_size: usize,
    written: AtomicU64,
}

impl std::fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("batch_size", &self.batch_size)
            .field("written", &self.written())
            .finish_non_exhaustive()
    }
}

/// Failure while streaming a queue: either the queue or the visitor.
#[derive(Debug, Error)]
pub enum StreamError<E> {
    /// Reading the queue failed.
    #[error(transparent)]
    Queue(#[from] DeferredQueueError),
    /// The visitor stopped the stream.
    #[error("deferred stream stopped: {0}")]
    Visitor(#[source] E),
}

impl DeferredQueue {
    /// Create one queue table per [`DeferredKind`] in `store`.
    ///
    /// # Errors
    /// Returns [`DeferredQueueError::Cache`] when a table cannot be created.
    pub fn new(store: &CacheTableStore, batch_size: usize) -> Result<Self, DeferredQueueError> {
        let lanes = DeferredKind::ALL
            .into_iter()
            .map(|kind| {
                let table = store.create_table(CacheTableModel::Deferred(kind))?;
                Ok((
                    kind,
                    Lane {
                        table,
                        buffer: Mutex::new(Vec::new()),
                    },
                ))
            })
            .collect::<Result<_, CacheError>>()?;
        Ok(Self {
            lanes,
            batch_size: batch_size.max(1),
            written: AtomicU64::new(0),
        })
    }

    fn lane(&self, kind: DeferredKind) -> Result<&Lane, DeferredQueueError> {
        self.lanes.get(&kind).ok_or_else(|| {
            DeferredQueueError::Cache(CacheError::Dropped {
                table: format!("deferred_{}", kind.as_str()),
            })
        })
    }

    /// Buffer `record`, writing the buffer of its kind once it holds a
    /// full batch. A batch that cannot be written stays buffered.
    ///
    /// # Errors
    /// Returns [`DeferredQueueError`] when a batch cannot be written.
    pub fn enqueue(&self, record: DeferredReference) -> Result<(), DeferredQueueError> {
        let kind = record.kind();
        let lane = self.lane(kind)?;
        let mut buffer = lane.buffer.lock();
        buffer.push(record);
        if buffer.len() >= self.batch_size {
            self.drain_buffer(kind, lane, &mut buffer)?;
        }
        Ok(())
    }

    /// Write every buffered record. Every lane is attempted; the records of
    /// a lane that fails stay buffered.
    ///
    /// # Errors
    /// Returns the first [`DeferredQueueError`] raised by a lane.
    pub fn flush(&self) -> Result<(), DeferredQueueError> {
        let mut first = None;
        for (kind, lane) in &self.lanes {
            let mut buffer = lane.buffer.lock();
            if buffer.is_empty() {
                continue;
            }
            if let Err(err) = self.drain_buffer(*kind, lane, &mut buffer) {
                debug!("keeping {} deferred {kind} records buffered", buffer.len());
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn drain_buffer(
        &self,
        kind: DeferredKind,
        lane: &Lane,
        buffer: &mut Vec<DeferredReference>,
    ) -> Result<(), DeferredQueueError> {
        let batch = std::mem::take(buffer);
        let written = self.write_batch(kind, lane, &batch);
        if written.is_err() {
            *buffer = batch;
        }
        written
    }

    fn write_batch(
        &self,
        kind: DeferredKind,
        lane: &Lane,
        batch: &[DeferredReference],
    ) -> Result<(), DeferredQueueError> {
        let rows = batch
            .iter()
            .map(|record| {
                serde_json::to_string(record)
                    .map(|payload| (record.source_key().get(), payload))
                    .map_err(|source| DeferredQueueError::Encode { kind, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sql = format!(
            "INSERT INTO {} (source_key, payload) VALUES (?1, ?2)",
            lane.table.name()
        );
        lane.table.with_connection("write deferred batch", |conn| {
            let transaction = conn.transaction()?;
            {
                let mut statement = transaction.prepare_cached(&sql)?;
                for (source_key, payload) in &rows {
                    statement.execute(params![source_key, payload])?;
                }
            }
            transaction.commit()
        })?;
        let count = u64::try_from(rows.len()).unwrap_or(u64::MAX);
        self.written.fetch_add(count, Ordering::SeqCst);
        debug!("wrote {count} deferred {kind} records");
        Ok(())
    }

    /// Records written to the backing tables so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// Records of `kind` written so far.
    ///
    /// # Errors
    /// Returns [`DeferredQueueError`] when the table cannot be read.
    pub fn written_of(&self, kind: DeferredKind) -> Result<u64, DeferredQueueError> {
        Ok(self.lane(kind)?.table.row_count()?)
    }

    /// Hand every unconsumed record of `kind` to `visit`, one group per
    /// source key, ordered by source key and then write order.
    ///
    /// Rows are read in pages and no table lock is held while `visit`
    /// runs, so the visitor may block on work that consumes records.
    ///
    /// # Errors
    /// Returns [`StreamError::Queue`] when reading fails and
    /// [`StreamError::Visitor`] with the visitor's error, which stops the
    /// stream.
    pub fn stream<E>(
        &self,
        kind: DeferredKind,
        mut visit: impl FnMut(DeferredGroup) -> Result<(), E>,
    ) -> Result<(), StreamError<E>> {
        let lane = self.lane(kind)?;
        let sql = format!(
            "SELECT seq, source_key, payload FROM {}
             WHERE consumed = 0 AND (source_key > ?1 OR (source_key = ?1 AND seq > ?2))
             ORDER BY source_key, seq
             LIMIT {STREAM_PAGE}",
            lane.table.name()
        );
        let mut cursor = (i64::MIN, i64::MIN);
        let mut current: Option<DeferredGroup> = None;
        loop {
            let rows: Vec<(i64, i64, String)> = lane
                .table
                .with_connection("stream deferred records", |conn| {
                    let mut statement = conn.prepare_cached(&sql)?;
                    statement
                        .query_map(params![cursor.0, cursor.1], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()
                })
                .map_err(DeferredQueueError::from)?;
            let exhausted = rows.len() < STREAM_PAGE;
            for (seq, source_key, payload) in rows {
                cursor = (source_key, seq);
                let reference = serde_json::from_str(&payload)
                    .map_err(|source| DeferredQueueError::Decode { kind, seq, source })?;
                let source = InternalKey::new(source_key);
                let record = StoredReference { seq, reference };
                match current.as_mut() {
                    Some(group) if group.source == source => group.records.push(record),
                    _ => {
                        let next = DeferredGroup {
                            kind,
                            source,
                            records: vec![record],
                        };
                        if let Some(done) = current.replace(next) {
                            visit(done).map_err(StreamError::Visitor)?;
                        }
                    }
                }
            }
            if exhausted {
                break;
            }
        }
        if let Some(done) = current {
            visit(done).map_err(StreamError::Visitor)?;
        }
        Ok(())
    }

    /// Mark records of `kind` as consumed so they are neither streamed nor
    /// counted as pending again.
    ///
    /// # Errors
    /// Returns [`DeferredQueueError`] when the update fails.
    pub fn mark_consumed(&self, kind: DeferredKind, seqs: &[i64]) -> Result<(), DeferredQueueError> {
        if seqs.is_empty() {
            return Ok(());
        }
        let lane = self.lane(kind)?;
        let sql = format!("UPDATE {} SET consumed = 1 WHERE seq = ?1", lane.table.name());
        lane.table.with_connection("mark deferred records", |conn| {
            let transaction = conn.transaction()?;
            {
                let mut statement = transaction.prepare_cached(&sql)?;
                for seq in seqs {
                    statement.execute([seq])?;
                }
            }
            transaction.commit()
        })?;
        Ok(())
    }

    /// Records written but never consumed, per kind. Kinds without pending
    /// records are omitted.
    ///
    /// # Errors
    /// Returns [`DeferredQueueError`] when a table cannot be read.
    pub fn pending(&self) -> Result<BTreeMap<DeferredKind, u64>, DeferredQueueError> {
        let mut pending = BTreeMap::new();
        for (kind, lane) in &self.lanes {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE consumed = 0",
                lane.table.name()
            );
            let count = lane.table.with_connection("count pending records", |conn| {
                conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
            })?;
            let buffered = lane.buffer.lock().len();
            let total = u64::try_from(count)
                .unwrap_or_default()
                .saturating_add(u64::try_from(buffered).unwrap_or_default());
            if total > 0 {
                pending.insert(*kind, total);
            }
        }
        Ok(pending)
    }
}
