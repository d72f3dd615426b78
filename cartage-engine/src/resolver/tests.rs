//! Unit tests for the resolution pass.

use super::*;
use std::collections::BTreeMap;

use cartage_core::TransferConfig;
use cartage_core::test_support::{
    MemoryPayloadStore, MemoryWriter, RecordingEventHandler, StaticSchemaMapping, external_id,
};
use cartage_data::{IdCacheEntry, OfflineFetcher};
use rstest::{fixture, rstest};

use crate::session::{SessionMonitor, SessionResources};

struct Harness {
    _resources: SessionResources,
    pass: PassContext,
    recorder: Arc<RecordingEventHandler>,
    monitor: Arc<SessionMonitor>,
    writer: Arc<MemoryWriter>,
    payloads: Arc<MemoryPayloadStore>,
}

impl Harness {
    fn targets(&self, base_path: Option<Utf8PathBuf>) -> ResolverTargets {
        ResolverTargets {
            writer: self.writer.clone(),
            payloads: self.payloads.clone(),
            fetcher: Arc::new(OfflineFetcher),
            base_path,
        }
    }

    fn known(&self, id: &str, key: i64) {
        self.pass
            .caches
            .feature()
            .insert(external_id(id), IdCacheEntry::new(InternalKey::new(key)))
            .expect("insert");
    }

    fn resolve(&self, base_path: Option<Utf8PathBuf>) -> ResolutionStats {
        resolve_deferred(
            &self.pass,
            self.targets(base_path),
            TransferConfig::default().resolution_pool(),
            &self.monitor,
            0,
        )
        .expect("resolution")
    }

    fn pending(&self) -> BTreeMap<DeferredKind, u64> {
        self.pass.queue.pending().expect("pending")
    }
}

#[fixture]
fn harness() -> Harness {
    let resources = SessionResources::create(&TransferConfig::default()).expect("resources");
    let events = EventDispatcher::new();
    let recorder = Arc::new(RecordingEventHandler::new());
    let monitor = Arc::new(SessionMonitor::new());
    events.add_handler(recorder.clone());
    events.add_handler(monitor.clone());
    let pass = PassContext::new(
        Arc::clone(&resources.caches),
        Arc::clone(&resources.queue),
        events,
        Arc::new(StaticSchemaMapping::new()),
    );
    Harness {
        _resources: resources,
        pass,
        recorder,
        monitor,
        writer: Arc::new(MemoryWriter::detached()),
        payloads: Arc::new(MemoryPayloadStore::new()),
    }
}

fn link(source: i64, target: &str) -> DeferredReference {
    DeferredReference::FeatureLink {
        source: InternalKey::new(source),
        target: external_id(target),
        role: None,
    }
}

#[rstest]
fn targets_seen_after_the_reference_are_resolved(harness: Harness) {
    harness.pass.queue.enqueue(link(1, "B")).expect("enqueue");
    harness
        .pass
        .queue
        .enqueue(DeferredReference::GroupMember {
            group: InternalKey::new(3),
            member: external_id("B"),
            role: Some("part".to_owned()),
            is_parent: false,
        })
        .expect("enqueue");
    harness.known("B", 2);

    let stats = harness.resolve(None);

    assert_eq!(
        stats,
        ResolutionStats {
            written: 2,
            resolved: 2,
            unresolved: 0,
        }
    );
    let applied = harness.writer.applied();
    assert_eq!(applied.len(), 2);
    assert!(applied.iter().all(|r| r.target_key == InternalKey::new(2)));
    assert!(
        applied
            .iter()
            .any(|r| r.kind == ReferenceKind::GroupMember && r.source == InternalKey::new(3))
    );
    assert!(harness.pending().is_empty());
}

#[rstest]
fn unknown_targets_are_reported_once(harness: Harness) {
    harness.pass.queue.enqueue(link(1, "B")).expect("enqueue");
    harness.pass.queue.enqueue(link(1, "Z")).expect("enqueue");
    harness.known("B", 2);

    let stats = harness.resolve(None);

    assert_eq!(stats.written, 2);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.unresolved, 1);
    assert_eq!(stats.resolved + stats.unresolved, stats.written);
    assert_eq!(harness.recorder.unresolved_count(), 1);
    assert_eq!(harness.monitor.unresolved(), 1);
    assert!(harness.pending().is_empty());
}

#[rstest]
fn nothing_deferred_means_nothing_to_resolve(harness: Harness) {
    let stats = harness.resolve(None);

    assert_eq!(stats, ResolutionStats::default());
    assert!(harness.writer.applied().is_empty());
}

#[rstest]
fn local_texture_images_are_stored_under_their_file_name(harness: Harness) {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("roof.png"), b"png bytes").expect("write image");
    let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
    harness
        .pass
        .queue
        .enqueue(DeferredReference::TextureImage {
            owner: InternalKey::new(5),
            uri: "roof.png".to_owned(),
        })
        .expect("enqueue");

    let stats = harness.resolve(Some(base));

    assert_eq!(stats.resolved, 1);
    assert_eq!(harness.payloads.get("roof.png"), Some(b"png bytes".to_vec()));
}

#[rstest]
fn missing_texture_images_are_unresolved(harness: Harness) {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
    harness
        .pass
        .queue
        .enqueue(DeferredReference::TextureImage {
            owner: InternalKey::new(5),
            uri: "missing.png".to_owned(),
        })
        .expect("enqueue");

    let stats = harness.resolve(Some(base));

    assert_eq!(stats.unresolved, 1);
    assert!(harness.payloads.names().is_empty());
    assert_eq!(harness.recorder.unresolved_count(), 1);
}

#[rstest]
fn sweeping_consumes_leftover_records(harness: Harness) {
    harness.pass.queue.enqueue(link(1, "B")).expect("enqueue");
    harness.pass.queue.enqueue(link(2, "C")).expect("enqueue");
    harness.pass.queue.flush().expect("flush");

    let leftover = sweep(&harness.pass.queue, &harness.pass.events).expect("sweep");

    assert_eq!(leftover, 2);
    assert_eq!(harness.recorder.unresolved_count(), 2);
    assert!(harness.pending().is_empty());
}

#[rstest]
fn stopped_drivers_submit_nothing(harness: Harness) {
    harness.pass.queue.enqueue(link(1, "B")).expect("enqueue");
    harness.pass.queue.flush().expect("flush");
    let factory = ResolverWorkerFactory::new(harness.pass.clone(), harness.targets(None));
    let pool = start_pool(
        "resolution",
        TransferConfig::default().resolution_pool(),
        SizingStrategy::Conservative,
        Arc::new(factory),
        &harness.pass.events,
        &harness.monitor,
    )
    .expect("pool");
    let driver = ResolutionDriver::new(&harness.pass.queue, &pool);
    driver.handle().shutdown();

    let groups = driver.run().expect("run");
    finish_pool(&pool, true).expect("finish");

    assert_eq!(groups, 0);
    assert_eq!(
        harness.pending(),
        BTreeMap::from([(DeferredKind::FeatureLink, 1)])
    );
}
