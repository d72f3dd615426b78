//! In-memory collaborators used by unit and behaviour tests.
//!
//! None of these types persist anything; they record what the engine asked
//! of them so tests can assert on it.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use geo::{Coord, Rect};
use parking_lot::Mutex;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};

use crate::collab::{
    DatabaseAdapter, DatabaseError, FeatureRows, FeatureWriter, FeatureWriterFactory,
    KeyAllocator, PayloadError, PayloadStore, SchemaMapping, WriteError,
};
use crate::event::{EventHandler, SessionEvent};
use crate::filter::{Predicate, ReferenceSystem};
use crate::model::{ExternalId, Feature, FeatureTypeId, InternalKey, ResolvedReference};

type IndexedEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// Build a feature whose envelope is the single point `(x, y)`.
///
/// # Panics
/// Panics when `id` is blank.
#[must_use]
#[expect(clippy::expect_used, reason = "test helper called with literal ids")]
pub fn point_feature(key: i64, id: &str, type_id: u32, x: f64, y: f64) -> Feature {
    let point = Coord { x, y };
    Feature::new(
        InternalKey::new(key),
        ExternalId::new(id).expect("test ids are non-empty"),
        FeatureTypeId::new(type_id),
        Rect::new(point, point),
    )
}

/// Parse a literal external id.
///
/// # Panics
/// Panics when `id` is blank.
#[must_use]
#[expect(clippy::expect_used, reason = "test helper called with literal ids")]
pub fn external_id(id: &str) -> ExternalId {
    ExternalId::new(id).expect("test ids are non-empty")
}

/// Feature database held in memory with an R-tree over envelopes.
pub struct MemoryDatabase {
    features: Vec<Feature>,
    index: RTree<IndexedEnvelope>,
    spatial_index: bool,
    srs: ReferenceSystem,
    workspace: Option<String>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("features", &self.features.len())
            .field("spatial_index", &self.spatial_index)
            .field("srs", &self.srs)
            .finish_non_exhaustive()
    }
}

impl MemoryDatabase {
    /// Database containing `features` with an active spatial index.
    pub fn new(features: impl IntoIterator<Item = Feature>) -> Self {
        let features: Vec<Feature> = features.into_iter().collect();
        let entries = features
            .iter()
            .enumerate()
            .map(|(position, feature)| {
                let min = feature.envelope.min();
                let max = feature.envelope.max();
                GeomWithData::new(
                    Rectangle::from_corners([min.x, min.y], [max.x, max.y]),
                    position,
                )
            })
            .collect();
        Self {
            features,
            index: RTree::bulk_load(entries),
            spatial_index: true,
            srs: ReferenceSystem::new(25832, true, "ETRS89 / UTM zone 32N"),
            workspace: None,
        }
    }

    /// Report spatial indexes as disabled.
    #[must_use]
    pub fn without_spatial_index(mut self) -> Self {
        self.spatial_index = false;
        self
    }

    /// Use `srs` as the database reference system.
    #[must_use]
    pub fn with_reference_system(mut self, srs: ReferenceSystem) -> Self {
        self.srs = srs;
        self
    }

    /// Report `name` as the active workspace.
    #[must_use]
    pub fn with_workspace(mut self, name: impl Into<String>) -> Self {
        self.workspace = Some(name.into());
        self
    }

    fn candidates(&self, predicate: &Predicate) -> Vec<usize> {
        match predicate.spatial_bounds() {
            Some(bounds) => {
                let envelope = AABB::from_corners(
                    [bounds.min().x, bounds.min().y],
                    [bounds.max().x, bounds.max().y],
                );
                let mut hits: Vec<usize> = self
                    .index
                    .locate_in_envelope_intersecting(&envelope)
                    .map(|entry| entry.data)
                    .collect();
                hits.sort_unstable();
                hits
            }
            None => (0..self.features.len()).collect(),
        }
    }
}

impl DatabaseAdapter for MemoryDatabase {
    fn spatial_index_enabled(&self) -> Result<bool, DatabaseError> {
        Ok(self.spatial_index)
    }

    fn reference_system(&self) -> ReferenceSystem {
        self.srs.clone()
    }

    fn workspace(&self) -> Option<String> {
        self.workspace.clone()
    }

    fn count(&self, predicate: &Predicate) -> Result<u64, DatabaseError> {
        let matched = self
            .candidates(predicate)
            .into_iter()
            .filter_map(|position| self.features.get(position))
            .filter(|feature| predicate.matches(feature))
            .count();
        Ok(u64::try_from(matched).unwrap_or(u64::MAX))
    }

    fn select(&self, predicate: &Predicate) -> Result<FeatureRows<'_>, DatabaseError> {
        let predicate = predicate.clone();
        let candidates = self.candidates(&predicate);
        Ok(Box::new(
            candidates
                .into_iter()
                .filter_map(|position| self.features.get(position))
                .filter(move |feature| predicate.matches(feature))
                .cloned()
                .map(Ok),
        ))
    }
}

/// Writer recording features and patches, echoing ids to its stream.
pub struct MemoryWriter {
    stream: Mutex<Option<Box<dyn Write + Send>>>,
    features: Mutex<Vec<Feature>>,
    applied: Mutex<Vec<ResolvedReference>>,
    closes: AtomicUsize,
    fail_on: Option<ExternalId>,
}

impl std::fmt::Debug for MemoryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWriter")
            .field("features", &self.features.lock().len())
            .field("applied", &self.applied.lock().len())
            .field("closes", &self.closes.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MemoryWriter {
    /// Writer over `stream`.
    #[must_use]
    pub fn new(stream: Box<dyn Write + Send>) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            features: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_on: None,
        }
    }

    /// Writer without an output stream.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(Box::new(std::io::sink()))
    }

    /// Fail when asked to write the feature with id `id`.
    #[must_use]
    pub fn failing_on(mut self, id: ExternalId) -> Self {
        self.fail_on = Some(id);
        self
    }

    /// Features written so far.
    #[must_use]
    pub fn features(&self) -> Vec<Feature> {
        self.features.lock().clone()
    }

    /// Patches applied so far.
    #[must_use]
    pub fn applied(&self) -> Vec<ResolvedReference> {
        self.applied.lock().clone()
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl FeatureWriter for MemoryWriter {
    fn write(&self, feature: &Feature) -> Result<(), WriteError> {
        if self.fail_on.as_ref() == Some(&feature.external_id) {
            return Err(WriteError::Encode {
                message: format!("refusing to encode {}", feature.external_id),
            });
        }
        let mut stream = self.stream.lock();
        let out = stream.as_mut().ok_or(WriteError::Closed)?;
        writeln!(out, "{}", feature.external_id)?;
        self.features.lock().push(feature.clone());
        Ok(())
    }

    fn apply(&self, reference: &ResolvedReference) -> Result<(), WriteError> {
        let mut stream = self.stream.lock();
        let out = stream.as_mut().ok_or(WriteError::Closed)?;
        writeln!(out, "{} -> {}", reference.source, reference.target_key)?;
        self.applied.lock().push(reference.clone());
        Ok(())
    }

    fn close(&self) -> Result<(), WriteError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(mut out) = self.stream.lock().take() {
            out.flush()?;
        }
        Ok(())
    }
}

/// Factory keeping every [`MemoryWriter`] it opened.
#[derive(Debug, Default)]
pub struct MemoryWriterFactory {
    writers: Mutex<Vec<Arc<MemoryWriter>>>,
    fail_on: Option<ExternalId>,
    refuse_open: bool,
}

impl MemoryWriterFactory {
    /// Factory opening plain recording writers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writers fail on the feature with id `id`.
    #[must_use]
    pub fn failing_on(mut self, id: ExternalId) -> Self {
        self.fail_on = Some(id);
        self
    }

    /// Every `open` call fails.
    #[must_use]
    pub fn refusing_open(mut self) -> Self {
        self.refuse_open = true;
        self
    }

    /// Writers opened so far, in order.
    #[must_use]
    pub fn writers(&self) -> Vec<Arc<MemoryWriter>> {
        self.writers.lock().clone()
    }
}

impl FeatureWriterFactory for MemoryWriterFactory {
    fn open(&self, stream: Box<dyn Write + Send>) -> Result<Arc<dyn FeatureWriter>, WriteError> {
        if self.refuse_open {
            return Err(WriteError::Encode {
                message: "writer unavailable".to_owned(),
            });
        }
        let writer = match &self.fail_on {
            Some(id) => MemoryWriter::new(stream).failing_on(id.clone()),
            None => MemoryWriter::new(stream),
        };
        let writer = Arc::new(writer);
        self.writers.lock().push(Arc::clone(&writer));
        Ok(writer)
    }
}

/// Event handler keeping every event.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingEventHandler {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    /// Number of unresolved-reference reports.
    #[must_use]
    pub fn unresolved_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, SessionEvent::UnresolvedReference { .. }))
            .count()
    }

    /// Number of per-item failures.
    #[must_use]
    pub fn item_failures(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, SessionEvent::ItemFailed { .. }))
            .count()
    }

    /// Messages of every interrupt received.
    #[must_use]
    pub fn interrupts(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Interrupt(interrupt) => Some(interrupt.message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sum of all object counter increments.
    #[must_use]
    pub fn objects_total(&self) -> u64 {
        self.events
            .lock()
            .iter()
            .map(|event| match event {
                SessionEvent::ObjectCounter(counts) => counts.values().sum(),
                _ => 0,
            })
            .sum()
    }
}

impl EventHandler for RecordingEventHandler {
    fn handle_event(&self, event: &SessionEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Schema mapping backed by a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaMapping {
    names: BTreeMap<FeatureTypeId, String>,
    groups: BTreeSet<FeatureTypeId>,
}

impl StaticSchemaMapping {
    /// Mapping without types.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type name.
    #[must_use]
    pub fn with_type(mut self, type_id: u32, name: &str) -> Self {
        self.names.insert(FeatureTypeId::new(type_id), name.to_owned());
        self
    }

    /// Register a grouping type.
    #[must_use]
    pub fn with_group_type(mut self, type_id: u32, name: &str) -> Self {
        self.groups.insert(FeatureTypeId::new(type_id));
        self.with_type(type_id, name)
    }
}

impl SchemaMapping for StaticSchemaMapping {
    fn type_name(&self, type_id: FeatureTypeId) -> Option<String> {
        self.names.get(&type_id).cloned()
    }

    fn is_group_type(&self, type_id: FeatureTypeId) -> bool {
        self.groups.contains(&type_id)
    }
}

/// Payload store keeping bytes in memory.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    stored: Mutex<BTreeMap<String, (InternalKey, Vec<u8>)>>,
}

impl MemoryPayloadStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names stored so far.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.stored.lock().keys().cloned().collect()
    }

    /// Bytes stored under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.stored.lock().get(name).map(|(_, bytes)| bytes.clone())
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn store(&self, owner: InternalKey, name: &str, bytes: &[u8]) -> Result<(), PayloadError> {
        self.stored
            .lock()
            .insert(name.to_owned(), (owner, bytes.to_vec()));
        Ok(())
    }
}

/// Key allocator counting up from a start value.
#[derive(Debug)]
pub struct SequenceKeyAllocator {
    next: AtomicI64,
}

impl SequenceKeyAllocator {
    /// Allocator whose first key is `start`.
    #[must_use]
    pub const fn starting_at(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

impl KeyAllocator for SequenceKeyAllocator {
    fn next_key(&self) -> Result<InternalKey, DatabaseError> {
        Ok(InternalKey::new(self.next.fetch_add(1, Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TileFilter;
    use rstest::{fixture, rstest};

    #[fixture]
    fn database() -> MemoryDatabase {
        MemoryDatabase::new([
            point_feature(1, "A", 1, 1.0, 1.0),
            point_feature(2, "B", 1, 6.0, 1.0),
            point_feature(3, "C", 2, 6.0, 6.0),
        ])
    }

    #[rstest]
    fn select_uses_tile_membership(database: MemoryDatabase) {
        let extent = Rect::new(Coord { x: 5.0, y: 0.0 }, Coord { x: 10.0, y: 5.0 });
        let predicate = Predicate::Within(TileFilter::new(extent, true, false));
        let ids: Vec<String> = database
            .select(&predicate)
            .expect("select")
            .map(|row| row.expect("row").external_id.to_string())
            .collect();
        assert_eq!(ids, vec!["B".to_owned()]);
        assert_eq!(database.count(&Predicate::All).expect("count"), 3);
    }

    #[rstest]
    fn writer_echoes_ids_and_counts_closes() {
        let writer = MemoryWriter::detached();
        writer
            .write(&point_feature(1, "A", 1, 0.0, 0.0))
            .expect("write");
        writer.close().expect("close");
        assert!(matches!(
            writer.write(&point_feature(2, "B", 1, 0.0, 0.0)),
            Err(WriteError::Closed)
        ));
        assert_eq!(writer.close_count(), 1);
        assert_eq!(writer.features().len(), 1);
    }
}
