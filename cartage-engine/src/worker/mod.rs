//! Main-pass workers.
//!
//! Each worker registers the ids it sees, writes its feature and either
//! resolves a reference on the spot or defers it to the resolution pass.
//! Counters are kept per worker and reported once when the worker exits.
//!
//! A feature's id is visible in the caches while its write is in flight.
//! The [`WriteLedger`] tells lookups whether the feature behind a key has
//! actually reached the output; targets that have not are treated as
//! unknown.

use std::collections::HashMap;
use std::sync::Arc;

use cartage_core::pool::{Interrupt, Worker, WorkerError, WorkerFactory};
use cartage_core::{
    Counters, EventDispatcher, ExportOptions, ExternalId, Feature, FeatureReference,
    FeatureWriter, InternalKey, KeyAllocator, ReferenceKind, ResolvedReference, SchemaMapping,
    SessionEvent, WriteError,
};
use cartage_data::{
    DeferredQueue, DeferredReference, IdCache, IdCacheEntry, IdCacheManager, InsertOutcome,
};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::import::ImportLog;
use crate::splitter::ImportItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    InFlight,
    Failed,
}

/// Write state of the features registered but not yet written.
///
/// Keys are marked in flight before their ids are registered and
/// forgotten once written, so a key found through a cache lookup is
/// either written, in flight or failed.
#[derive(Debug, Default)]
pub struct WriteLedger(Mutex<HashMap<InternalKey, WriteState>>);

impl WriteLedger {
    fn begin(&self, key: InternalKey) {
        self.0.lock().insert(key, WriteState::InFlight);
    }

    fn complete(&self, key: InternalKey) {
        self.0.lock().remove(&key);
    }

    fn fail(&self, key: InternalKey) {
        self.0.lock().insert(key, WriteState::Failed);
    }

    /// Whether the feature stored under `key` reached the output.
    #[must_use]
    pub fn is_written(&self, key: InternalKey) -> bool {
        !self.0.lock().contains_key(&key)
    }

    /// Features whose write failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.0
            .lock()
            .values()
            .filter(|state| **state == WriteState::Failed)
            .count()
    }
}

/// Collaborators shared by the workers of one pass.
#[derive(Clone)]
pub struct PassContext {
    /// Feature and geometry id caches.
    pub caches: Arc<IdCacheManager>,
    /// Queue receiving deferred references.
    pub queue: Arc<DeferredQueue>,
    /// Session dispatcher.
    pub events: EventDispatcher,
    /// Feature type names.
    pub schema: Arc<dyn SchemaMapping>,
    /// Write state of registered features.
    pub writes: Arc<WriteLedger>,
}

impl std::fmt::Debug for PassContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassContext")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl PassContext {
    /// Context over the caches and queue of one session.
    #[must_use]
    pub fn new(
        caches: Arc<IdCacheManager>,
        queue: Arc<DeferredQueue>,
        events: EventDispatcher,
        schema: Arc<dyn SchemaMapping>,
    ) -> Self {
        Self {
            caches,
            queue,
            events,
            schema,
            writes: Arc::default(),
        }
    }

    /// Cache resolving targets of `kind`: texture bindings point at
    /// geometries, every other reference at features.
    pub(crate) fn cache_for(&self, kind: ReferenceKind) -> &IdCache {
        match kind {
            ReferenceKind::TextureBinding => self.caches.geometry(),
            ReferenceKind::GroupMember | ReferenceKind::GroupParent | ReferenceKind::FeatureLink => {
                self.caches.feature()
            }
        }
    }

    /// Entry of `target` when its feature has been written.
    pub(crate) fn written_target(
        &self,
        kind: ReferenceKind,
        target: &ExternalId,
    ) -> Result<Option<IdCacheEntry>, WorkerError> {
        let entry = self.cache_for(kind).lookup(target)?;
        Ok(entry.filter(|found| self.writes.is_written(found.key)))
    }

    fn insert_ids(&self, id: &ExternalId, feature: &Feature) -> Result<InsertOutcome, WorkerError> {
        let entry = IdCacheEntry::new(feature.key).with_type(feature.type_id);
        let outcome = self.caches.feature().insert(id.clone(), entry)?;
        if outcome.is_inserted() && !feature.geometries.is_empty() {
            self.caches
                .geometry()
                .insert(id.clone(), IdCacheEntry::new(feature.key))?;
        }
        Ok(outcome)
    }

    /// Mark `feature` in flight and register its ids; the outcome tells
    /// whether the id was already known. A known id leaves the ledger
    /// untouched.
    fn register(&self, feature: &Feature) -> Result<InsertOutcome, WorkerError> {
        self.writes.begin(feature.key);
        let outcome = self.insert_ids(&feature.external_id, feature)?;
        if !outcome.is_inserted() {
            self.writes.complete(feature.key);
        }
        Ok(outcome)
    }

    /// Make `feature` reachable under the id it was read with as well.
    fn register_alias(&self, alias: &ExternalId, feature: &Feature) -> Result<(), WorkerError> {
        if let InsertOutcome::Existing(existing) = self.insert_ids(alias, feature)? {
            debug!(
                "original id {alias} of {} already maps to key {}",
                feature.external_id, existing.key
            );
        }
        Ok(())
    }

    /// Record the outcome of writing `feature`.
    fn settle_write(
        &self,
        feature: &Feature,
        written: Result<(), WriteError>,
    ) -> Result<bool, WorkerError> {
        match written {
            Ok(()) => {
                self.writes.complete(feature.key);
                Ok(true)
            }
            Err(err) => {
                self.writes.fail(feature.key);
                self.write_failed(&feature.external_id, err)?;
                Ok(false)
            }
        }
    }

    fn item_failed(&self, external_id: &ExternalId, message: String) {
        warn!("{message}");
        self.events.trigger(&SessionEvent::ItemFailed {
            external_id: Some(external_id.clone()),
            message,
        });
    }

    /// Report per-item write failures and skip the item; any other failure
    /// stops the session.
    pub(crate) fn write_failed(&self, external_id: &ExternalId, err: WriteError) -> Result<(), WorkerError> {
        match err {
            WriteError::Encode { .. } | WriteError::Sink { .. } => {
                let message = format!("failed to write feature {external_id}: {err}");
                self.item_failed(external_id, message);
                Ok(())
            }
            WriteError::Io(_) | WriteError::Closed => Err(Box::new(err)),
        }
    }

    fn defer_textures(&self, feature: &Feature) -> Result<(), WorkerError> {
        for texture in &feature.textures {
            self.queue.enqueue(DeferredReference::TextureImage {
                owner: feature.key,
                uri: texture.uri.clone(),
            })?;
        }
        Ok(())
    }

    fn report(&self, counters: &mut Counters) {
        let taken = std::mem::take(counters);
        if !taken.objects.is_empty() {
            self.events.trigger(&SessionEvent::ObjectCounter(taken.objects));
        }
        if !taken.geometries.is_empty() {
            self.events
                .trigger(&SessionEvent::GeometryCounter(taken.geometries));
        }
    }
}

/// Deferred record patching `source` with `reference`.
#[must_use]
pub fn defer(source: InternalKey, reference: &FeatureReference) -> DeferredReference {
    match reference.kind {
        ReferenceKind::GroupMember | ReferenceKind::GroupParent => DeferredReference::GroupMember {
            group: source,
            member: reference.target.clone(),
            role: reference.role.clone(),
            is_parent: reference.kind == ReferenceKind::GroupParent,
        },
        ReferenceKind::FeatureLink => DeferredReference::FeatureLink {
            source,
            target: reference.target.clone(),
            role: reference.role.clone(),
        },
        ReferenceKind::TextureBinding => DeferredReference::TextureBinding {
            surface: source,
            texture: reference.target.clone(),
        },
    }
}

/// Creates one [`ExportWorker`] per main-pool thread.
pub struct ExportWorkerFactory {
    pass: PassContext,
    writer: Arc<dyn FeatureWriter>,
    options: ExportOptions,
}

impl std::fmt::Debug for ExportWorkerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportWorkerFactory")
            .field("pass", &self.pass)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ExportWorkerFactory {
    /// Factory writing to `writer`.
    pub fn new(pass: PassContext, writer: Arc<dyn FeatureWriter>, options: ExportOptions) -> Self {
        Self {
            pass,
            writer,
            options,
        }
    }
}

impl WorkerFactory<Feature> for ExportWorkerFactory {
    fn create_worker(
        &self,
        interrupt: &Interrupt,
    ) -> Result<Box<dyn Worker<Feature>>, WorkerError> {
        Ok(Box::new(ExportWorker {
            pass: self.pass.clone(),
            writer: Arc::clone(&self.writer),
            options: self.options.clone(),
            interrupt: interrupt.clone(),
            counters: Counters::default(),
        }))
    }
}

/// Writes database features to the export writer.
pub struct ExportWorker {
    pass: PassContext,
    writer: Arc<dyn FeatureWriter>,
    options: ExportOptions,
    interrupt: Interrupt,
    counters: Counters,
}

impl ExportWorker {
    /// Whether `reference` may be patched during the main pass.
    const fn inline(&self, reference: &FeatureReference) -> bool {
        let grouping = matches!(
            reference.kind,
            ReferenceKind::GroupMember | ReferenceKind::GroupParent
        );
        !(grouping && self.options.group_members_as_xlinks)
    }

    fn resolve_or_defer(
        &self,
        feature: &Feature,
        reference: &FeatureReference,
    ) -> Result<(), WorkerError> {
        if self.inline(reference) {
            let known = self.pass.written_target(reference.kind, &reference.target)?;
            if let Some(entry) = known {
                let resolved = ResolvedReference {
                    kind: reference.kind,
                    source: feature.key,
                    target: reference.target.clone(),
                    target_key: entry.key,
                    role: reference.role.clone(),
                };
                return match self.writer.apply(&resolved) {
                    Ok(()) => Ok(()),
                    Err(err) => self.pass.write_failed(&feature.external_id, err),
                };
            }
        }
        self.pass.queue.enqueue(defer(feature.key, reference))?;
        Ok(())
    }
}

impl Worker<Feature> for ExportWorker {
    fn handle(&mut self, feature: Feature) -> Result<(), WorkerError> {
        if self.interrupt.is_set() {
            return Ok(());
        }
        if let InsertOutcome::Existing(_) = self.pass.register(&feature)? {
            debug!("feature {} has already been exported", feature.external_id);
            return Ok(());
        }
        if !self.pass.settle_write(&feature, self.writer.write(&feature))? {
            return Ok(());
        }
        self.counters.record_feature(&feature);
        for reference in &feature.references {
            self.resolve_or_defer(&feature, reference)?;
        }
        if self.options.export_textures {
            self.pass.defer_textures(&feature)?;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.pass.report(&mut self.counters);
    }
}

/// Creates one [`ImportWorker`] per import-pool thread.
pub struct ImportWorkerFactory {
    pass: PassContext,
    sink: Arc<dyn FeatureWriter>,
    keys: Arc<dyn KeyAllocator>,
    log: Option<Arc<ImportLog>>,
}

impl std::fmt::Debug for ImportWorkerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportWorkerFactory")
            .field("pass", &self.pass)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

impl ImportWorkerFactory {
    /// Factory writing to `sink` with keys drawn from `keys`.
    pub fn new(
        pass: PassContext,
        sink: Arc<dyn FeatureWriter>,
        keys: Arc<dyn KeyAllocator>,
        log: Option<Arc<ImportLog>>,
    ) -> Self {
        Self {
            pass,
            sink,
            keys,
            log,
        }
    }
}

impl WorkerFactory<ImportItem> for ImportWorkerFactory {
    fn create_worker(
        &self,
        interrupt: &Interrupt,
    ) -> Result<Box<dyn Worker<ImportItem>>, WorkerError> {
        Ok(Box::new(ImportWorker {
            pass: self.pass.clone(),
            sink: Arc::clone(&self.sink),
            keys: Arc::clone(&self.keys),
            log: self.log.clone(),
            interrupt: interrupt.clone(),
            counters: Counters::default(),
        }))
    }
}

/// Stores imported features in the database sink.
pub struct ImportWorker {
    pass: PassContext,
    sink: Arc<dyn FeatureWriter>,
    keys: Arc<dyn KeyAllocator>,
    log: Option<Arc<ImportLog>>,
    interrupt: Interrupt,
    counters: Counters,
}

impl Worker<ImportItem> for ImportWorker {
    fn handle(&mut self, item: ImportItem) -> Result<(), WorkerError> {
        if self.interrupt.is_set() {
            return Ok(());
        }
        let key = self.keys.next_key()?;
        let ImportItem {
            external_id,
            original_id,
            source,
        } = item;
        let feature = source.into_feature(key, external_id);
        if let InsertOutcome::Existing(existing) = self.pass.register(&feature)? {
            self.pass.item_failed(
                &feature.external_id,
                format!(
                    "skipping feature {}: the id was already imported with key {}",
                    feature.external_id, existing.key
                ),
            );
            return Ok(());
        }
        if let Some(original) = &original_id {
            self.pass.register_alias(original, &feature)?;
        }
        if !self.pass.settle_write(&feature, self.sink.write(&feature))? {
            return Ok(());
        }
        self.counters.record_feature(&feature);
        for reference in &feature.references {
            self.pass.queue.enqueue(defer(feature.key, reference))?;
        }
        self.pass.defer_textures(&feature)?;
        if let Some(log) = &self.log {
            let type_name = self
                .pass
                .schema
                .type_name(feature.type_id)
                .unwrap_or_else(|| feature.type_id.to_string());
            log.record(&type_name, &feature.external_id, feature.key)?;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.pass.report(&mut self.counters);
    }
}
