//! Behavioural tests for tiling grids.

use std::cell::RefCell;

use cartage_core::{TileSuffixMode, Tiling};
use geo::{Coord, Rect, coord};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

#[derive(Default)]
struct TilingWorld {
    tiling: RefCell<Option<Tiling>>,
    points: RefCell<Vec<Coord<f64>>>,
    hits: RefCell<Vec<usize>>,
    order: RefCell<Vec<String>>,
}

#[fixture]
fn world() -> TilingWorld {
    TilingWorld::default()
}

#[given("a 2x2 tiling over a 10 by 10 extent")]
fn two_by_two(world: &TilingWorld) {
    let extent = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 10.0, y: 10.0 });
    let tiling = Tiling::new(extent, 2, 2).expect("valid grid");
    world.tiling.replace(Some(tiling));
}

#[given("features on every grid line and corner")]
fn grid_points(world: &TilingWorld) {
    let stops = [0.0, 2.5, 5.0, 7.5, 10.0];
    let points = stops
        .iter()
        .flat_map(|&x| stops.iter().map(move |&y| coord! { x: x, y: y }))
        .collect();
    world.points.replace(points);
}

#[when("each tile selects its features")]
fn select(world: &TilingWorld) {
    let guard = world.tiling.borrow();
    let tiling = guard.as_ref().expect("tiling must exist");
    let points = world.points.borrow();
    let hits = points
        .iter()
        .map(|point| {
            tiling
                .tiles()
                .filter(|tile| tile.tile_filter().contains(*point))
                .count()
        })
        .collect();
    world.hits.replace(hits);
}

#[when("the tiles are listed")]
fn list(world: &TilingWorld) {
    let guard = world.tiling.borrow();
    let tiling = guard.as_ref().expect("tiling must exist");
    let order = tiling
        .tiles()
        .map(|tile| tile.suffix(TileSuffixMode::RowColumn))
        .collect();
    world.order.replace(order);
}

#[then("every feature is selected by exactly one tile")]
fn exactly_once(world: &TilingWorld) {
    let hits = world.hits.borrow();
    assert_eq!(hits.len(), 25);
    assert!(hits.iter().all(|&count| count == 1), "hits: {hits:?}");
}

#[then("the order is 0_0, 0_1, 1_0, 1_1")]
fn row_major(world: &TilingWorld) {
    assert_eq!(*world.order.borrow(), vec!["0_0", "0_1", "1_0", "1_1"]);
}

#[scenario(path = "tests/features/tiling.feature", index = 0)]
fn shared_edges_counted_once(world: TilingWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/tiling.feature", index = 1)]
fn tiles_in_row_major_order(world: TilingWorld) {
    let _ = world;
}
