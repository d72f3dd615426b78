//! Partitioned, size-bounded id cache with spill-to-disk overflow.
//!
//! Each partition keeps its hot entries in an LRU map. When a partition
//! outgrows its share of the configured size, a page of the least recently
//! used entries moves to a pending map and a background spill pool writes
//! it to the partition's backing table. Entries stay visible throughout:
//! lookups consult memory, then the pending map, then the table, and a
//! table hit is promoted back into memory.
//!
//! Inserts are first-wins. Racing inserts of the same id are serialised on
//! the partition lock; the loser observes the winner's entry.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cartage_core::pool::{
    Interrupt, PoolSettings, SizingStrategy, Worker, WorkerError, WorkerFactory, WorkerFailure,
    WorkerPool,
};
use cartage_core::{CacheSizing, ExternalId, FeatureTypeId, IdCacheConfig, InternalKey};
use log::{debug, error};
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{OptionalExtension, params};

use crate::cache::{CacheError, CacheTable, CacheTableModel, CacheTableStore, IdCacheKind};

/// Value stored for an external id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdCacheEntry {
    /// Internal key the id maps to.
    pub key: InternalKey,
    /// Type of the identified object, when known.
    pub type_id: Option<FeatureTypeId>,
}

impl IdCacheEntry {
    /// Entry without type information.
    #[must_use]
    pub const fn new(key: InternalKey) -> Self {
        Self { key, type_id: None }
    }

    /// Attach the object's type.
    #[must_use]
    pub const fn with_type(mut self, type_id: FeatureTypeId) -> Self {
        self.type_id = Some(type_id);
        self
    }
}

/// Result of [`IdCache::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The id was new and now maps to the supplied entry.
    Inserted,
    /// The id was already known; the stored entry is unchanged.
    Existing(IdCacheEntry),
}

impl InsertOutcome {
    /// Whether this call created the mapping.
    #[must_use]
    pub const fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// Occupancy snapshot of an [`IdCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdCacheStats {
    /// Entries held in the LRU maps.
    pub in_memory: usize,
    /// Evicted entries not yet written to the backing table.
    pub pending: usize,
    /// Spill batches written so far.
    pub spill_batches: u64,
}

type Evicted = Vec<(ExternalId, IdCacheEntry)>;

struct Partition {
    memory: Mutex<LruCache<ExternalId, IdCacheEntry>>,
    pending: Mutex<HashMap<ExternalId, IdCacheEntry>>,
    spilled: AtomicBool,
}

struct SpillBatch {
    partition: usize,
    entries: Evicted,
}

struct Inner {
    kind: IdCacheKind,
    partitions: Vec<Partition>,
    capacity: usize,
    page_size: usize,
    batch_size: usize,
    table: Arc<CacheTable>,
    spill_batches: AtomicU64,
    spill_failure: Mutex<Option<String>>,
}

#[expect(
    clippy::float_arithmetic,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "the page is a rounded-up fraction of a small positive capacity"
)]
fn page_size(capacity: usize, page_factor: f64) -> usize {
    let scaled = f64::from(u32::try_from(capacity).unwrap_or(u32::MAX)) * page_factor;
    (scaled.ceil() as usize).clamp(1, capacity.max(1))
}

impl Inner {
    #[expect(
        clippy::indexing_slicing,
        reason = "the index is reduced modulo the non-empty partition count"
    )]
    fn partition_for(&self, id: &ExternalId) -> (usize, &Partition) {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let count = u64::try_from(self.partitions.len()).unwrap_or(1);
        let index = usize::try_from(hasher.finish().rem_euclid(count)).unwrap_or_default();
        (index, &self.partitions[index])
    }

    fn lookup_table(&self, id: &ExternalId) -> Result<Option<IdCacheEntry>, CacheError> {
        let sql = format!(
            "SELECT key, type_id FROM {} WHERE external_id = ?1",
            self.table.name()
        );
        self.table.with_connection("look up id", |conn| {
            conn.query_row(&sql, [id.as_str()], |row| {
                let key: i64 = row.get(0)?;
                let type_id: Option<u32> = row.get(1)?;
                Ok(IdCacheEntry {
                    key: InternalKey::new(key),
                    type_id: type_id.map(FeatureTypeId::new),
                })
            })
            .optional()
        })
    }

    /// Move a page of LRU entries to the pending map once the partition
    /// outgrows its capacity. Must be called with the memory lock held.
    fn evict(
        &self,
        partition: &Partition,
        memory: &mut LruCache<ExternalId, IdCacheEntry>,
    ) -> Evicted {
        if memory.len() <= self.capacity {
            return Vec::new();
        }
        let mut evicted = Vec::with_capacity(self.page_size);
        while evicted.len() < self.page_size {
            let Some(entry) = memory.pop_lru() else {
                break;
            };
            evicted.push(entry);
        }
        partition.spilled.store(true, Ordering::SeqCst);
        partition
            .pending
            .lock()
            .extend(evicted.iter().map(|(id, entry)| (id.clone(), *entry)));
        evicted
    }

    fn spill(&self, batch: &SpillBatch) -> Result<(), CacheError> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (external_id, key, type_id) VALUES (?1, ?2, ?3)",
            self.table.name()
        );
        let Some(partition) = self.partitions.get(batch.partition) else {
            return Ok(());
        };
        for chunk in batch.entries.chunks(self.batch_size.max(1)) {
            self.table.with_connection("spill entries", |conn| {
                let transaction = conn.transaction()?;
                {
                    let mut statement = transaction.prepare_cached(&sql)?;
                    for (id, entry) in chunk {
                        statement.execute(params![
                            id.as_str(),
                            entry.key.get(),
                            entry.type_id.map(FeatureTypeId::get)
                        ])?;
                    }
                }
                transaction.commit()
            })?;
            let mut pending = partition.pending.lock();
            for (id, _) in chunk {
                pending.remove(id);
            }
        }
        self.spill_batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct SpillWorker(Arc<Inner>);

impl Worker<SpillBatch> for SpillWorker {
    fn handle(&mut self, batch: SpillBatch) -> Result<(), WorkerError> {
        self.0.spill(&batch).map_err(Into::into)
    }
}

struct SpillFactory(Arc<Inner>);

impl WorkerFactory<SpillBatch> for SpillFactory {
    fn create_worker(
        &self,
        _interrupt: &Interrupt,
    ) -> Result<Box<dyn Worker<SpillBatch>>, WorkerError> {
        Ok(Box::new(SpillWorker(Arc::clone(&self.0))))
    }
}

/// Concurrent map from external ids to internal keys.
///
/// # Examples
/// ```
/// use cartage_core::{CacheSizing, ExternalId, InternalKey};
/// use cartage_data::cache::{CacheTableStore, IdCacheKind};
/// use cartage_data::id_cache::{IdCache, IdCacheEntry, InsertOutcome};
///
/// let store = CacheTableStore::create(None).unwrap();
/// let cache = IdCache::new(IdCacheKind::Feature, &store, &CacheSizing::default(), 100, 1).unwrap();
/// let id = ExternalId::new("BLDG_1").unwrap();
/// let first = IdCacheEntry::new(InternalKey::new(1));
/// assert_eq!(cache.insert(id.clone(), first).unwrap(), InsertOutcome::Inserted);
/// let second = IdCacheEntry::new(InternalKey::new(2));
/// assert_eq!(cache.insert(id.clone(), second).unwrap(), InsertOutcome::Existing(first));
/// assert_eq!(cache.lookup(&id).unwrap(), Some(first));
/// cache.shutdown().unwrap();
/// ```
pub struct IdCache {
    inner: Arc<Inner>,
    spill_pool: WorkerPool<SpillBatch>,
}

impl std::fmt::Debug for IdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdCache")
            .field("kind", &self.inner.kind)
            .field("partitions", &self.inner.partitions.len())
            .field("capacity", &self.inner.capacity)
            .field("table", &self.inner.table.name())
            .finish_non_exhaustive()
    }
}

impl IdCache {
    /// Create a cache backed by a new table of `store`.
    ///
    /// The spill pool runs between one and `spill_threads` workers and is
    /// started eagerly.
    ///
    /// # Errors
    /// Returns [`CacheError`] when the backing table or the spill pool
    /// cannot be created.
    pub fn new(
        kind: IdCacheKind,
        store: &CacheTableStore,
        sizing: &CacheSizing,
        batch_size: usize,
        spill_threads: usize,
    ) -> Result<Self, CacheError> {
        let table = store.create_table(CacheTableModel::IdMap(kind))?;
        let partition_count = sizing.partitions.max(1);
        let capacity = sizing.cache_size.div_ceil(partition_count).max(1);
        let partitions = (0..partition_count)
            .map(|_| Partition {
                memory: Mutex::new(LruCache::unbounded()),
                pending: Mutex::new(HashMap::new()),
                spilled: AtomicBool::new(false),
            })
            .collect();
        let inner = Arc::new(Inner {
            kind,
            partitions,
            capacity,
            page_size: page_size(capacity, sizing.page_factor),
            batch_size: batch_size.max(1),
            table,
            spill_batches: AtomicU64::new(0),
            spill_failure: Mutex::new(None),
        });
        let spill_error = |message: String| CacheError::Spill {
            cache: kind.as_str(),
            message,
        };
        let spill_pool = WorkerPool::new(
            format!("{}-spill", kind.as_str()),
            PoolSettings {
                min_threads: 1,
                max_threads: spill_threads.max(1),
                queue_capacity: partition_count.saturating_mul(2),
            },
            SizingStrategy::Conservative.policy(),
            Arc::new(SpillFactory(Arc::clone(&inner))),
        )
        .map_err(|err| spill_error(err.to_string()))?;
        let failures = Arc::clone(&inner);
        spill_pool.set_error_handler(Arc::new(move |pool: &str, failure: WorkerFailure| {
            error!("{pool}: {failure}");
            failures
                .spill_failure
                .lock()
                .get_or_insert_with(|| failure.to_string());
        }));
        let started = spill_pool
            .prestart_core_workers()
            .map_err(|err| spill_error(err.to_string()))?;
        if started == 0 {
            return Err(spill_error("no spill worker could be started".to_owned()));
        }
        debug!(
            "{}: {partition_count} partitions of {capacity} entries",
            kind.as_str()
        );
        Ok(Self { inner, spill_pool })
    }

    /// Which ids this cache maps.
    #[must_use]
    pub fn kind(&self) -> IdCacheKind {
        self.inner.kind
    }

    /// Find the entry of `id`.
    ///
    /// # Errors
    /// Returns [`CacheError`] when the backing table cannot be read.
    pub fn lookup(&self, id: &ExternalId) -> Result<Option<IdCacheEntry>, CacheError> {
        let (index, partition) = self.inner.partition_for(id);
        let (found, evicted) = {
            let mut memory = partition.memory.lock();
            if let Some(entry) = memory.get(id) {
                return Ok(Some(*entry));
            }
            if let Some(entry) = partition.pending.lock().get(id).copied() {
                return Ok(Some(entry));
            }
            if !partition.spilled.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let Some(entry) = self.inner.lookup_table(id)? else {
                return Ok(None);
            };
            memory.put(id.clone(), entry);
            (entry, self.inner.evict(partition, &mut memory))
        };
        self.submit_spill(index, evicted);
        Ok(Some(found))
    }

    /// Map `id` to `entry` unless it is already mapped.
    ///
    /// # Errors
    /// Returns [`CacheError`] when the backing table cannot be read.
    pub fn insert(&self, id: ExternalId, entry: IdCacheEntry) -> Result<InsertOutcome, CacheError> {
        let (index, partition) = self.inner.partition_for(&id);
        let (outcome, evicted) = {
            let mut memory = partition.memory.lock();
            if let Some(existing) = memory.get(&id) {
                return Ok(InsertOutcome::Existing(*existing));
            }
            if let Some(existing) = partition.pending.lock().get(&id).copied() {
                return Ok(InsertOutcome::Existing(existing));
            }
            let stored = if partition.spilled.load(Ordering::SeqCst) {
                self.inner.lookup_table(&id)?
            } else {
                None
            };
            let outcome = stored.map_or(InsertOutcome::Inserted, InsertOutcome::Existing);
            memory.put(id, stored.unwrap_or(entry));
            (outcome, self.inner.evict(partition, &mut memory))
        };
        self.submit_spill(index, evicted);
        Ok(outcome)
    }

    fn submit_spill(&self, partition: usize, entries: Evicted) {
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        if let Err(err) = self.spill_pool.submit(SpillBatch { partition, entries }) {
            // The entries stay in the pending map and remain visible.
            debug!("{}: keeping {count} entries in memory: {err}", self.inner.kind.as_str());
        }
    }

    /// Current occupancy.
    #[must_use]
    pub fn stats(&self) -> IdCacheStats {
        let (in_memory, pending) = self
            .inner
            .partitions
            .iter()
            .fold((0, 0), |(memory, pending), partition| {
                (
                    memory + partition.memory.lock().len(),
                    pending + partition.pending.lock().len(),
                )
            });
        IdCacheStats {
            in_memory,
            pending,
            spill_batches: self.inner.spill_batches.load(Ordering::Relaxed),
        }
    }

    /// Wait for outstanding spills and stop the spill pool.
    ///
    /// Lookups keep working afterwards; further evictions stay in memory.
    ///
    /// # Errors
    /// Returns [`CacheError::Spill`] when a spill batch failed.
    pub fn shutdown(&self) -> Result<(), CacheError> {
        let cache = self.inner.kind.as_str();
        self.spill_pool
            .shutdown_and_wait()
            .map_err(|err| CacheError::Spill {
                cache,
                message: err.to_string(),
            })?;
        match self.inner.spill_failure.lock().clone() {
            Some(message) => Err(CacheError::Spill { cache, message }),
            None => Ok(()),
        }
    }
}

/// Feature and geometry id caches of one session.
#[derive(Debug)]
pub struct IdCacheManager {
    feature: IdCache,
    geometry: IdCache,
}

impl IdCacheManager {
    /// Create both caches in `store`.
    ///
    /// # Errors
    /// Returns the first [`CacheError`] raised while creating a cache.
    pub fn new(
        store: &CacheTableStore,
        config: &IdCacheConfig,
        batch_size: usize,
        spill_threads: usize,
    ) -> Result<Self, CacheError> {
        let feature = IdCache::new(
            IdCacheKind::Feature,
            store,
            &config.feature,
            batch_size,
            spill_threads,
        )?;
        let geometry = IdCache::new(
            IdCacheKind::Geometry,
            store,
            &config.geometry,
            batch_size,
            spill_threads,
        )?;
        Ok(Self { feature, geometry })
    }

    /// Cache of feature ids.
    #[must_use]
    pub const fn feature(&self) -> &IdCache {
        &self.feature
    }

    /// Cache of geometry ids.
    #[must_use]
    pub const fn geometry(&self) -> &IdCache {
        &self.geometry
    }

    /// Shut down both caches, reporting the first failure.
    ///
    /// # Errors
    /// Returns the first [`CacheError`] raised by either cache.
    pub fn shutdown(&self) -> Result<(), CacheError> {
        let feature = self.feature.shutdown();
        let geometry = self.geometry.shutdown();
        feature.and(geometry)
    }
}
