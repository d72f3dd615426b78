//! Unit tests for the SQLite feature database.

use super::*;
use std::collections::BTreeSet;

use cartage_core::test_support::{external_id, point_feature};
use cartage_core::{FeatureTypeId, Tiling};
use geo::Coord;
use rstest::{fixture, rstest};
use tempfile::TempDir;

fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Rect<f64> {
    Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y })
}

fn ids(rows: FeatureRows<'_>) -> Vec<String> {
    rows.map(|row| row.expect("row").external_id.as_str().to_owned())
        .collect()
}

#[fixture]
fn store() -> SqliteFeatureStore {
    SqliteFeatureStore::open_in_memory().expect("open store")
}

#[rstest]
fn fresh_databases_have_a_spatial_index(store: SqliteFeatureStore) {
    assert!(store.spatial_index_enabled().expect("status"));
    store.drop_spatial_index().expect("drop");
    assert!(!store.spatial_index_enabled().expect("status"));
    store.create_spatial_index().expect("create");
    assert!(store.spatial_index_enabled().expect("status"));
}

#[rstest]
fn dropped_index_stays_dropped_after_reopening() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("city.db");
    let store = SqliteFeatureStore::open(&path).expect("open");
    store.drop_spatial_index().expect("drop");
    drop(store);
    let reopened = SqliteFeatureStore::open(&path).expect("reopen");
    assert!(!reopened.spatial_index_enabled().expect("status"));
}

#[rstest]
fn features_round_trip_through_the_body(store: SqliteFeatureStore) {
    let feature = point_feature(3, "BLDG_3", 26, 1.0, 2.0)
        .with_attribute("height", "12.5")
        .with_reference(ReferenceKind::FeatureLink, external_id("BLDG_4"))
        .with_texture("tex/roof.png");
    store.insert(&feature).expect("insert");
    let loaded = store
        .feature_by_id(&external_id("BLDG_3"))
        .expect("query")
        .expect("present");
    assert_eq!(loaded, feature);
    assert_eq!(store.feature_count().expect("count"), 1);
}

#[rstest]
fn duplicate_external_ids_are_rejected(store: SqliteFeatureStore) {
    store
        .insert(&point_feature(1, "DUP", 26, 0.0, 0.0))
        .expect("insert");
    let result = store.insert(&point_feature(2, "DUP", 26, 0.0, 0.0));
    assert!(matches!(result, Err(SqliteStoreError::Statement { .. })));
}

#[rstest]
fn selections_page_through_every_row(store: SqliteFeatureStore) {
    let total = SELECT_PAGE + 7;
    for n in 0..total {
        let key = i64::try_from(n).expect("small");
        store
            .insert(&point_feature(key, &format!("F{n}"), 26, 0.0, 0.0))
            .expect("insert");
    }
    let selected = ids(store.select(&Predicate::All).expect("select"));
    assert_eq!(selected.len(), total);
    assert_eq!(selected.first().map(String::as_str), Some("F0"));
    assert_eq!(store.count(&Predicate::All).expect("count"), 7 + 256);
}

#[rstest]
fn tile_predicates_select_by_envelope_centre(store: SqliteFeatureStore) {
    let mut feature = point_feature(1, "WIDE", 26, 0.0, 0.0);
    feature.envelope = rect(4.0, 1.0, 8.0, 3.0);
    store.insert(&feature).expect("insert");
    store
        .insert(&point_feature(2, "EDGE", 26, 5.0, 5.0))
        .expect("insert");

    let tiling = Tiling::new(rect(0.0, 0.0, 10.0, 10.0), 2, 2).expect("tiling");
    let lower_right = tiling.tile_at(0, 1).expect("tile");
    let upper_right = tiling.tile_at(1, 1).expect("tile");
    assert_eq!(
        ids(store.select(&lower_right.filter()).expect("select")),
        vec!["WIDE"]
    );
    assert_eq!(
        ids(store.select(&upper_right.filter()).expect("select")),
        vec!["EDGE"]
    );
}

#[rstest]
fn non_spatial_predicates_are_applied(store: SqliteFeatureStore) {
    store
        .insert(&point_feature(1, "A", 26, 0.0, 0.0))
        .expect("insert");
    store
        .insert(&point_feature(2, "B", 44, 0.0, 0.0))
        .expect("insert");
    let types = Predicate::TypeIn(BTreeSet::from([FeatureTypeId::new(44)]));
    assert_eq!(ids(store.select(&types).expect("select")), vec!["B"]);
}

#[rstest]
fn keys_continue_after_the_highest_stored_key(store: SqliteFeatureStore) {
    assert_eq!(store.next_key().expect("key"), InternalKey::new(1));
    store
        .insert(&point_feature(40, "F40", 26, 0.0, 0.0))
        .expect("insert");
    assert_eq!(store.next_key().expect("key"), InternalKey::new(41));
}

#[rstest]
fn metadata_survives_reopening() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("city.db");
    let store = SqliteFeatureStore::open(&path).expect("open");
    store
        .set_reference_system(&ReferenceSystem::new(25832, true, "ETRS89 / UTM 32N"))
        .expect("srs");
    store.set_workspace(Some("LIVE")).expect("workspace");
    drop(store);

    let reopened = SqliteFeatureStore::open(&path).expect("reopen");
    let srs = reopened.reference_system();
    assert_eq!(srs.srid, 25832);
    assert!(srs.is_3d);
    assert_eq!(reopened.workspace().as_deref(), Some("LIVE"));
    reopened.set_workspace(None).expect("clear");
    assert_eq!(reopened.workspace(), None);
}

#[rstest]
fn applied_references_become_links(store: SqliteFeatureStore) {
    let reference = ResolvedReference {
        kind: ReferenceKind::GroupMember,
        source: InternalKey::new(1),
        target: external_id("M1"),
        target_key: InternalKey::new(2),
        role: Some("member".to_owned()),
    };
    FeatureWriter::apply(&store, &reference).expect("apply");
    let links = store.links_from(InternalKey::new(1)).expect("links");
    assert_eq!(
        links,
        vec![StoredLink {
            kind: "group_member".to_owned(),
            target_key: InternalKey::new(2),
            target: "M1".to_owned(),
            role: Some("member".to_owned()),
        }]
    );
}

#[rstest]
fn closed_sinks_refuse_writes(store: SqliteFeatureStore) {
    FeatureWriter::close(&store).expect("close");
    FeatureWriter::close(&store).expect("second close is harmless");
    let result = FeatureWriter::write(&store, &point_feature(1, "A", 26, 0.0, 0.0));
    assert!(matches!(result, Err(WriteError::Closed)));
    assert_eq!(store.count(&Predicate::All).expect("reads still work"), 0);
}

#[rstest]
fn payloads_are_stored_per_owner(store: SqliteFeatureStore) {
    PayloadStore::store(&store, InternalKey::new(7), "roof.png", b"png").expect("store");
    PayloadStore::store(&store, InternalKey::new(7), "roof.png", b"png2").expect("replace");
    assert_eq!(
        store
            .texture_image(InternalKey::new(7), "roof.png")
            .expect("query"),
        Some(b"png2".to_vec())
    );
    assert_eq!(
        store
            .texture_image(InternalKey::new(8), "roof.png")
            .expect("query"),
        None
    );
}
