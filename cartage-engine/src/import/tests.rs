//! Unit tests for the import controller.

use super::*;
use std::path::PathBuf;

use cartage_core::test_support::{StaticSchemaMapping, external_id};
use cartage_core::{
    DatabaseAdapter, FeatureReference, FeatureTypeId, IdMode, Predicate, ReadError,
    ReferenceKind, SourceFeature, TextureReference, TransferConfig,
};
use cartage_data::SqliteFeatureStore;
use geo::{Coord, Rect};
use rstest::{fixture, rstest};

#[fixture]
fn store() -> Arc<SqliteFeatureStore> {
    Arc::new(SqliteFeatureStore::open_in_memory().expect("in-memory store"))
}

fn importer(store: &Arc<SqliteFeatureStore>, config: TransferConfig) -> Importer {
    let context = TransferContext::new(
        config,
        store.clone(),
        Arc::new(StaticSchemaMapping::new().with_type(26, "Building")),
    );
    Importer::new(context)
}

fn source(id: &str, x: f64) -> SourceFeature {
    let point = Coord { x, y: 1.0 };
    SourceFeature::new(
        Some(external_id(id)),
        FeatureTypeId::new(26),
        Rect::new(point, point),
    )
}

fn linked(id: &str, target: &str) -> SourceFeature {
    let mut feature = source(id, 2.0);
    feature.references.push(FeatureReference {
        kind: ReferenceKind::FeatureLink,
        target: external_id(target),
        role: None,
    });
    feature
}

fn records(features: Vec<SourceFeature>) -> impl Iterator<Item = Result<SourceFeature, ReadError>> {
    features.into_iter().map(Ok)
}

#[rstest]
fn links_to_later_features_are_resolved(store: Arc<SqliteFeatureStore>) {
    let importer = importer(&store, TransferConfig::default());

    let report = importer
        .run(records(vec![linked("A", "B"), source("B", 1.0)]), store.clone())
        .expect("import");

    assert!(report.completed);
    assert_eq!(report.submitted, 2);
    assert_eq!(report.counters.total_objects(), 2);
    assert_eq!(report.resolution.resolved, 1);
    assert_eq!(report.resolution.unresolved, 0);
    assert_eq!(importer.state(), SessionState::Finished { success: true });

    let a = store
        .feature_by_id(&external_id("A"))
        .expect("lookup")
        .expect("A stored");
    let b = store
        .feature_by_id(&external_id("B"))
        .expect("lookup")
        .expect("B stored");
    let links = store.links_from(a.key).expect("links");
    assert_eq!(links.len(), 1);
    assert_eq!(links.first().map(|link| link.target_key), Some(b.key));
}

#[rstest]
fn unknown_targets_are_counted_as_unresolved(store: Arc<SqliteFeatureStore>) {
    let importer = importer(&store, TransferConfig::default());

    let report = importer
        .run(records(vec![linked("A", "Z")]), store.clone())
        .expect("import");

    assert!(report.completed);
    assert_eq!(report.resolution.written, 1);
    assert_eq!(report.resolution.unresolved, 1);
}

#[rstest]
fn links_survive_replaced_ids(store: Arc<SqliteFeatureStore>) {
    let mut config = TransferConfig::default();
    config.import.id_handling.mode = IdMode::Replace;
    let importer = importer(&store, config);

    let report = importer
        .run(records(vec![linked("A", "B"), source("B", 1.0)]), store.clone())
        .expect("import");

    assert_eq!(report.resolution.resolved, 1);
    assert_eq!(report.resolution.unresolved, 0);
    let stored = store
        .select(&Predicate::All)
        .expect("select")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows");
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|feature| feature.external_id.as_str() != "A"));
    let links: Vec<_> = stored
        .iter()
        .flat_map(|feature| store.links_from(feature.key).expect("links"))
        .collect();
    assert_eq!(links.len(), 1);
    let target = links.first().map(|link| link.target_key);
    assert!(stored.iter().any(|feature| Some(feature.key) == target));
}

#[rstest]
fn undecodable_records_are_skipped(store: Arc<SqliteFeatureStore>) {
    let importer = importer(&store, TransferConfig::default());
    let input = vec![
        Ok(source("A", 1.0)),
        Err(ReadError::Decode {
            line: 2,
            message: "expected value".to_owned(),
        }),
    ];

    let report = importer
        .run(input.into_iter(), store.clone())
        .expect("import");

    assert_eq!(report.submitted, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed_items, 1);
    assert_eq!(store.feature_count().expect("count"), 1);
}

#[rstest]
fn enabled_log_without_file_is_rejected(store: Arc<SqliteFeatureStore>) {
    let mut config = TransferConfig::default();
    config.import.log.enabled = true;
    let importer = importer(&store, config);

    let err = importer
        .run(records(vec![source("A", 1.0)]), store.clone())
        .expect_err("no log file");

    assert_eq!(err.code(), Some(ErrorCode::InvalidOutput));
    assert_eq!(importer.state(), SessionState::Finished { success: false });
    assert_eq!(store.feature_count().expect("count"), 0);
}

#[rstest]
fn the_import_log_lists_every_feature(store: Arc<SqliteFeatureStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let file: PathBuf = dir.path().join("logs").join("import.csv");
    let mut config = TransferConfig::default();
    config.import.log.enabled = true;
    config.import.log.mode = ImportLogMode::Truncate;
    config.import.log.file = Some(file.clone());
    let importer = importer(&store, config);

    let report = importer
        .run(records(vec![source("A", 1.0), source("B", 2.0)]), store.clone())
        .expect("import");

    let written = std::fs::read_to_string(&file).expect("read log");
    let mut lines: Vec<&str> = written.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines.len(), 3);
    assert!(lines.contains(&"type_name,external_id,key"));
    assert!(lines.iter().any(|line| line.starts_with("Building,A,")));
    assert_eq!(
        report.log_file.as_ref().map(|path| path.as_std_path()),
        Some(file.as_path())
    );
}

#[rstest]
fn texture_images_are_stored_in_the_database(store: Arc<SqliteFeatureStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("roof.png"), b"png bytes").expect("write image");
    let mut config = TransferConfig::default();
    config.import.base_path = Some(dir.path().to_path_buf());
    let importer = importer(&store, config);
    let mut textured = source("A", 1.0);
    textured.textures.push(TextureReference {
        uri: "roof.png".to_owned(),
    });

    let report = importer
        .run(records(vec![textured]), store.clone())
        .expect("import");

    assert_eq!(report.resolution.resolved, 1);
    let a = store
        .feature_by_id(&external_id("A"))
        .expect("lookup")
        .expect("A stored");
    assert_eq!(
        store.texture_image(a.key, "roof.png").expect("read image"),
        Some(b"png bytes".to_vec())
    );
}

#[rstest]
fn cancelling_before_the_session_starts_has_no_effect(store: Arc<SqliteFeatureStore>) {
    let importer = importer(&store, TransferConfig::default());
    importer.cancellation_handle().cancel("stopped by user");

    let report = importer
        .run(records(vec![source("A", 1.0)]), store.clone())
        .expect("cancellation is not an error");

    assert!(report.completed);
    assert_eq!(report.interrupt, None);
}
