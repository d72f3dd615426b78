//! Unit tests for the export controller.

use super::*;
use std::io::Write;

use cartage_core::test_support::{
    MemoryDatabase, MemoryWriter, MemoryWriterFactory, RecordingEventHandler,
    StaticSchemaMapping, external_id, point_feature,
};
use cartage_core::{
    EventDispatcher, FeatureWriter, ReferenceKind, TransferConfig, WriteError,
};
use geo::{Coord, Rect};
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn output(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.dir.path().join("out").join("city.jsonl"))
            .expect("utf8 path")
    }
}

#[fixture]
fn workspace() -> Workspace {
    Workspace {
        dir: tempfile::tempdir().expect("tempdir"),
    }
}

fn city() -> MemoryDatabase {
    MemoryDatabase::new([
        point_feature(1, "A", 26, 1.0, 1.0)
            .with_reference(ReferenceKind::FeatureLink, external_id("E")),
        point_feature(2, "B", 26, 6.0, 1.0),
        point_feature(3, "C", 44, 6.0, 6.0),
        point_feature(4, "D", 26, 1.0, 6.0),
        point_feature(5, "E", 44, 2.0, 2.0),
    ])
}

fn tiled(config: &mut TransferConfig) -> &mut TilingConfig {
    let extent = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 10.0, y: 10.0 });
    config.tiling.insert(TilingConfig::new(extent, 2, 2))
}

fn exporter(
    database: MemoryDatabase,
    config: TransferConfig,
    writers: &Arc<MemoryWriterFactory>,
) -> Exporter {
    let context = TransferContext::new(
        config,
        Arc::new(database),
        Arc::new(StaticSchemaMapping::new().with_type(26, "Building")),
    );
    let factory: Arc<dyn FeatureWriterFactory> = writers.clone();
    Exporter::new(context, factory)
}

#[rstest]
fn untiled_exports_write_one_file_and_resolve_late_targets(workspace: Workspace) {
    let writers = Arc::new(MemoryWriterFactory::new());
    let exporter = exporter(city(), TransferConfig::default(), &writers);
    let output = workspace.output();

    let report = exporter.run(&output).expect("export");

    assert!(report.completed);
    assert_eq!(report.tiles.len(), 1);
    assert_eq!(report.totals.total_objects(), 5);
    assert_eq!(report.resolution.resolved, 1);
    assert_eq!(report.resolution.unresolved, 0);
    let opened = writers.writers();
    assert_eq!(opened.len(), 1);
    assert!(opened.iter().all(|writer| writer.close_count() == 1));
    assert_eq!(opened.first().map(|writer| writer.applied().len()), Some(1));
    assert!(output.exists());
    assert_eq!(exporter.state(), SessionState::Finished { success: true });
}

#[rstest]
fn tiled_exports_write_one_file_per_tile(workspace: Workspace) {
    let writers = Arc::new(MemoryWriterFactory::new());
    let mut config = TransferConfig::default();
    tiled(&mut config);
    let exporter = exporter(city(), config, &writers);

    let report = exporter.run(&workspace.output()).expect("export");

    assert_eq!(report.tiles.len(), 4);
    assert_eq!(writers.writers().len(), 4);
    assert_eq!(report.totals.total_objects(), 5);
    let first = report.tiles.first().expect("first tile");
    assert!(first.output.ends_with("tile_0_0/city.jsonl"));
    assert_eq!(first.counters.total_objects(), 2);
    assert!(report.tiles.iter().all(|tile| tile.output.exists()));
}

#[rstest]
fn empty_tiles_are_skipped_when_asked(workspace: Workspace) {
    let writers = Arc::new(MemoryWriterFactory::new());
    let mut config = TransferConfig::default();
    tiled(&mut config).skip_empty_tiles = true;
    let database = MemoryDatabase::new([point_feature(1, "A", 26, 1.0, 1.0)]);
    let exporter = exporter(database, config, &writers);

    let report = exporter.run(&workspace.output()).expect("export");

    assert_eq!(writers.writers().len(), 1);
    assert_eq!(report.tiles.iter().filter(|tile| tile.skipped).count(), 3);
    assert_eq!(report.totals.total_objects(), 1);
}

#[rstest]
fn links_to_features_that_failed_to_write_stay_unresolved(workspace: Workspace) {
    let writers = Arc::new(MemoryWriterFactory::new().failing_on(external_id("B")));
    let database = MemoryDatabase::new([
        point_feature(1, "A", 26, 1.0, 1.0)
            .with_reference(ReferenceKind::FeatureLink, external_id("B")),
        point_feature(2, "B", 26, 2.0, 2.0),
    ]);
    let exporter = exporter(database, TransferConfig::default(), &writers);

    let report = exporter.run(&workspace.output()).expect("export");

    assert!(report.completed);
    assert_eq!(report.failed_items, 1);
    assert_eq!(report.totals.total_objects(), 1);
    assert_eq!(report.resolution.resolved, 0);
    assert_eq!(report.resolution.unresolved, 1);
    let opened = writers.writers();
    assert!(opened.iter().all(|writer| writer.applied().is_empty()));
}

#[rstest]
fn tiling_requires_spatial_indexes(workspace: Workspace) {
    let writers = Arc::new(MemoryWriterFactory::new());
    let mut config = TransferConfig::default();
    tiled(&mut config);
    let exporter = exporter(city().without_spatial_index(), config, &writers);

    let err = exporter.run(&workspace.output()).expect_err("no index");

    assert_eq!(err.code(), Some(ErrorCode::SpatialIndexesNotActivated));
    assert!(writers.writers().is_empty());
    assert_eq!(exporter.state(), SessionState::Finished { success: false });
}

#[rstest]
fn directories_are_not_valid_outputs(workspace: Workspace) {
    let writers = Arc::new(MemoryWriterFactory::new());
    let exporter = exporter(city(), TransferConfig::default(), &writers);
    let output = workspace.output();
    std::fs::create_dir_all(&output).expect("create directory");

    let err = exporter.run(&output).expect_err("directory");

    assert_eq!(err.code(), Some(ErrorCode::InvalidOutput));
}

#[rstest]
#[case(true)]
#[case(false)]
fn failing_tiles_stop_the_export_unless_asked_to_continue(
    workspace: Workspace,
    #[case] continue_on_tile_error: bool,
) {
    let writers = Arc::new(MemoryWriterFactory::new().refusing_open());
    let mut config = TransferConfig::default();
    tiled(&mut config).continue_on_tile_error = continue_on_tile_error;
    let events = EventDispatcher::new();
    let recorder = Arc::new(RecordingEventHandler::new());
    events.add_handler(recorder.clone());
    let context = TransferContext::new(
        config,
        Arc::new(city()),
        Arc::new(StaticSchemaMapping::new()),
    )
    .with_events(events);
    let factory: Arc<dyn FeatureWriterFactory> = writers.clone();
    let exporter = Exporter::new(context, factory);

    let result = exporter.run(&workspace.output());

    let failed_tiles = recorder
        .events()
        .iter()
        .filter(|event| matches!(event, SessionEvent::TileFailed { .. }))
        .count();
    if continue_on_tile_error {
        let report = result.expect("export continues");
        assert_eq!(failed_tiles, 4);
        assert!(report.tiles.iter().all(|tile| tile.error.is_some()));
    } else {
        let err = result.expect_err("first tile fails");
        assert_eq!(err.code(), Some(ErrorCode::Io));
        assert_eq!(failed_tiles, 0);
    }
}

struct CancellingWriter {
    inner: MemoryWriter,
    cancel: CancellationHandle,
}

impl FeatureWriter for CancellingWriter {
    fn write(&self, feature: &cartage_core::Feature) -> Result<(), WriteError> {
        self.cancel.cancel("stopped by user");
        self.cancel.cancel("stopped again");
        self.inner.write(feature)
    }

    fn apply(&self, reference: &cartage_core::ResolvedReference) -> Result<(), WriteError> {
        self.inner.apply(reference)
    }

    fn close(&self) -> Result<(), WriteError> {
        self.inner.close()
    }
}

struct CancellingFactory(CancellationHandle);

impl FeatureWriterFactory for CancellingFactory {
    fn open(
        &self,
        stream: Box<dyn Write + Send>,
    ) -> Result<Arc<dyn FeatureWriter>, WriteError> {
        Ok(Arc::new(CancellingWriter {
            inner: MemoryWriter::new(stream),
            cancel: self.0.clone(),
        }))
    }
}

#[rstest]
fn cancelled_exports_report_an_incomplete_session(workspace: Workspace) {
    let events = EventDispatcher::new();
    let recorder = Arc::new(RecordingEventHandler::new());
    events.add_handler(recorder.clone());
    let mut config = TransferConfig::default();
    tiled(&mut config);
    let context = TransferContext::new(
        config,
        Arc::new(city()),
        Arc::new(StaticSchemaMapping::new()),
    )
    .with_events(events.clone());
    let exporter = Exporter::new(
        context,
        Arc::new(CancellingFactory(events.cancellation_handle())),
    );

    let report = exporter.run(&workspace.output()).expect("cancelling is not an error");

    assert!(!report.completed);
    assert_eq!(report.interrupt.as_deref(), Some("stopped by user"));
    assert_eq!(report.tiles.len(), 1);
    assert_eq!(exporter.state(), SessionState::Aborted);
}

#[rstest]
fn cancelled_exports_report_their_deferred_references(workspace: Workspace) {
    let events = EventDispatcher::new();
    let recorder = Arc::new(RecordingEventHandler::new());
    events.add_handler(recorder.clone());
    let database = MemoryDatabase::new([point_feature(1, "A", 26, 1.0, 1.0)
        .with_reference(ReferenceKind::FeatureLink, external_id("Z"))]);
    let context = TransferContext::new(
        TransferConfig::default(),
        Arc::new(database),
        Arc::new(StaticSchemaMapping::new()),
    )
    .with_events(events.clone());
    let exporter = Exporter::new(
        context,
        Arc::new(CancellingFactory(events.cancellation_handle())),
    );

    let report = exporter.run(&workspace.output()).expect("cancelling is not an error");

    assert!(!report.completed);
    assert_eq!(report.resolution.written, 1);
    assert_eq!(report.resolution.unresolved, 1);
    assert_eq!(report.resolution.resolved, 0);
    assert_eq!(recorder.unresolved_count(), 1);
}
