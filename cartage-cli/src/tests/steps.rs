//! Behaviour-driven step definitions driving the transfer command scenarios.

use super::*;
use std::cell::RefCell;
use std::fs;

use camino::Utf8PathBuf;
use cartage_core::test_support::external_id;
use cartage_core::{
    DatabaseAdapter, FeatureReference, FeatureTypeId, Predicate, ReferenceKind, SourceFeature,
};
use cartage_data::SqliteFeatureStore;
use geo::{Coord, Rect};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

/// Aggregates CLI scenario state so each step only needs a single world
/// argument.
struct CommandWorld {
    dir: TempDir,
    outcomes: RefCell<Vec<Result<Outcome, CliError>>>,
}

impl CommandWorld {
    fn path(&self, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.dir.path().join(name)).expect("utf8 path")
    }

    fn input(&self) -> Utf8PathBuf {
        self.path("city.jsonl")
    }

    fn database(&self) -> Utf8PathBuf {
        self.path("city.db")
    }

    fn output(&self) -> Utf8PathBuf {
        self.path("out/city.jsonl")
    }

    fn invoke(&self, args: &[String]) {
        let mut invocation = vec!["cartage".to_owned()];
        invocation.extend(args.iter().cloned());
        let outcome = Cli::try_parse_from(invocation)
            .map_err(CliError::ArgumentParsing)
            .and_then(execute);
        self.outcomes.borrow_mut().push(outcome);
    }

    fn import_with(&self, extra: &[&str]) {
        let mut args = vec![
            "import".to_owned(),
            format!("--{ARG_INPUT}"),
            self.input().into_string(),
            format!("--{ARG_DATABASE}"),
            self.database().into_string(),
        ];
        args.extend(extra.iter().map(|arg| (*arg).to_owned()));
        self.invoke(&args);
    }

    fn last_error(&self) -> String {
        let outcomes = self.outcomes.borrow();
        match outcomes.last() {
            Some(Err(err)) => err.to_string(),
            Some(Ok(outcome)) => panic!("expected an error, found {outcome:?}"),
            None => panic!("no command was run"),
        }
    }
}

#[fixture]
fn world() -> CommandWorld {
    CommandWorld {
        dir: TempDir::new().expect("tempdir"),
        outcomes: RefCell::new(Vec::new()),
    }
}

fn building(id: &str, x: f64, y: f64) -> SourceFeature {
    let point = Coord { x, y };
    SourceFeature::new(
        Some(external_id(id)),
        FeatureTypeId::new(26),
        Rect::new(point, point),
    )
}

#[given("a JSON-lines file with a building in each quarter where \"A\" links to \"D\"")]
fn quarter_buildings(#[from(world)] world: &CommandWorld) {
    let mut a = building("A", 2.0, 2.0);
    a.references.push(FeatureReference {
        kind: ReferenceKind::FeatureLink,
        target: external_id("D"),
        role: None,
    });
    let features = [
        a,
        building("B", 7.0, 2.0),
        building("C", 7.0, 7.0),
        building("D", 2.0, 7.0),
    ];
    let lines: Vec<String> = features
        .iter()
        .map(|feature| serde_json::to_string(feature).expect("encode feature"))
        .collect();
    fs::write(world.input(), lines.join("\n")).expect("write input");
}

#[when("I import the file and build the spatial index")]
fn import_indexed(#[from(world)] world: &CommandWorld) {
    world.import_with(&["--spatial-index"]);
}

#[when("I import the file replacing ids with the prefix \"ID_\"")]
fn import_replacing(#[from(world)] world: &CommandWorld) {
    world.import_with(&["--replace-ids", "--id-prefix", "ID_"]);
}

#[when("I export the database with a 2 by 2 tile grid")]
fn export_tiled(#[from(world)] world: &CommandWorld) {
    let args = [
        "export".to_owned(),
        format!("--{ARG_DATABASE}"),
        world.database().into_string(),
        format!("--{ARG_OUTPUT}"),
        world.output().into_string(),
        format!("--{ARG_TILE_ROWS}"),
        "2".to_owned(),
        format!("--{ARG_TILE_COLUMNS}"),
        "2".to_owned(),
        format!("--{ARG_EXTENT}"),
        "0,0,10,10".to_owned(),
    ];
    world.invoke(&args);
}

#[when("I export without naming a database")]
fn export_without_database(#[from(world)] world: &CommandWorld) {
    let args = [
        "export".to_owned(),
        format!("--{ARG_OUTPUT}"),
        world.output().into_string(),
    ];
    world.invoke(&args);
}

#[when("I import a file that does not exist")]
fn import_missing(#[from(world)] world: &CommandWorld) {
    world.import_with(&[]);
}

#[then("the import resolved 1 reference")]
fn import_resolved(#[from(world)] world: &CommandWorld) {
    let outcomes = world.outcomes.borrow();
    let report = outcomes
        .iter()
        .find_map(|outcome| match outcome {
            Ok(Outcome::Imported(report)) => Some(report),
            _ => None,
        })
        .expect("an import succeeded");
    assert!(report.completed);
    assert_eq!(report.counters.total_objects(), 4);
    assert_eq!(report.resolution.resolved, 1);
}

#[then("4 tile files are written")]
fn four_tiles(#[from(world)] world: &CommandWorld) {
    let outcomes = world.outcomes.borrow();
    match outcomes.last() {
        Some(Ok(Outcome::Exported(report))) => {
            assert!(report.completed);
            assert_eq!(report.tiles.len(), 4);
            assert_eq!(report.totals.total_objects(), 4);
            assert!(report.tiles.iter().all(|tile| tile.output.exists()));
        }
        other => panic!("expected an export report, found {other:?}"),
    }
}

#[then("the lower left tile lists \"A\"")]
fn lower_left_lists_a(#[from(world)] world: &CommandWorld) {
    let written = fs::read_to_string(world.path("out/tile_0_0/city.jsonl")).expect("read tile");
    let ids: Vec<String> = written
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("decode line"))
        .filter(|value| value.get("record").and_then(serde_json::Value::as_str) == Some("feature"))
        .filter_map(|value| {
            value
                .get("external_id")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
        })
        .collect();
    assert_eq!(ids, vec!["A".to_owned()]);
}

#[then("every stored feature has an id starting with \"ID_\"")]
fn ids_replaced(#[from(world)] world: &CommandWorld) {
    let store = SqliteFeatureStore::open(world.database().as_std_path()).expect("open database");
    let stored = store
        .select(&Predicate::All)
        .expect("select")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows");
    assert_eq!(stored.len(), 4);
    assert!(
        stored
            .iter()
            .all(|feature| feature.external_id.as_str().starts_with("ID_"))
    );
}

#[then("the CLI reports that the \"database\" flag is missing")]
fn reports_missing_database(#[from(world)] world: &CommandWorld) {
    let outcomes = world.outcomes.borrow();
    match outcomes.last() {
        Some(Err(CliError::MissingArgument { field, .. })) => assert_eq!(*field, ARG_DATABASE),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[then("the CLI reports that the \"input\" file is missing")]
fn reports_missing_input(#[from(world)] world: &CommandWorld) {
    let message = world.last_error();
    assert!(message.starts_with("input path"), "unexpected error {message}");
    assert!(message.ends_with("does not exist"), "unexpected error {message}");
    assert!(!world.database().exists());
}

macro_rules! register_transfer_scenario {
    ($fn_name:ident, $scenario_title:literal) => {
        #[scenario(path = "tests/features/transfer_commands.feature", name = $scenario_title)]
        fn $fn_name(#[from(world)] world: CommandWorld) {
            let _ = world;
        }
    };
}

register_transfer_scenario!(
    import_then_export_tiles,
    "importing features and exporting them as tiles"
);
register_transfer_scenario!(replacing_ids, "replacing ids on import");
register_transfer_scenario!(rejecting_missing_database, "rejecting an export without a database");
register_transfer_scenario!(rejecting_missing_input, "rejecting an import of a missing file");
