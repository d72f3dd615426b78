//! Behavioural tests for the id cache.

use std::cell::RefCell;
use std::thread;

use cartage_core::test_support::external_id;
use cartage_core::{CacheSizing, InternalKey};
use cartage_data::{CacheTableStore, IdCache, IdCacheEntry, IdCacheKind, InsertOutcome};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

/// Cache under test, its store and the outcomes of concurrent inserts.
struct CacheWorld {
    store: CacheTableStore,
    cache: RefCell<Option<IdCache>>,
    outcomes: RefCell<Vec<InsertOutcome>>,
}

impl CacheWorld {
    fn with_cache<R>(&self, action: impl FnOnce(&IdCache) -> R) -> R {
        let guard = self.cache.borrow();
        let cache = guard.as_ref().expect("cache must be created first");
        action(cache)
    }
}

#[fixture]
fn world() -> CacheWorld {
    CacheWorld {
        store: CacheTableStore::create(None).expect("create store"),
        cache: RefCell::new(None),
        outcomes: RefCell::new(Vec::new()),
    }
}

#[given("a feature cache holding 10 entries in 2 partitions")]
fn small_cache(world: &CacheWorld) {
    let sizing = CacheSizing {
        cache_size: 10,
        page_factor: 0.5,
        partitions: 2,
    };
    let cache =
        IdCache::new(IdCacheKind::Feature, &world.store, &sizing, 16, 2).expect("create cache");
    world.cache.replace(Some(cache));
}

#[when("500 distinct identifiers are inserted")]
fn insert_many(world: &CacheWorld) {
    world.with_cache(|cache| {
        for key in 0..500 {
            let outcome = cache
                .insert(
                    external_id(&format!("BLDG_{key}")),
                    IdCacheEntry::new(InternalKey::new(key)),
                )
                .expect("insert");
            assert!(outcome.is_inserted());
        }
    });
}

#[when("the cache is shut down")]
fn shut_down(world: &CacheWorld) {
    world.with_cache(|cache| cache.shutdown().expect("shutdown"));
}

#[when("6 threads insert the identifier \"BLDG_1\" with their own key")]
fn race(world: &CacheWorld) {
    let outcomes = world.with_cache(|cache| {
        thread::scope(|scope| {
            let handles: Vec<_> = (1..=6_i64)
                .map(|key| {
                    scope.spawn(move || {
                        cache
                            .insert(
                                external_id("BLDG_1"),
                                IdCacheEntry::new(InternalKey::new(key)),
                            )
                            .expect("insert")
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("racer"))
                .collect::<Vec<_>>()
        })
    });
    world.outcomes.replace(outcomes);
}

#[then("every identifier resolves to its first key")]
fn all_resolve(world: &CacheWorld) {
    world.with_cache(|cache| {
        for key in 0..500 {
            let entry = cache
                .lookup(&external_id(&format!("BLDG_{key}")))
                .expect("lookup")
                .expect("present");
            assert_eq!(entry.key, InternalKey::new(key));
        }
    });
}

#[then("the backing table received spilled entries")]
fn table_has_rows(world: &CacheWorld) {
    world.with_cache(|cache| {
        let stats = cache.stats();
        assert!(stats.spill_batches > 0);
        assert!(stats.in_memory <= 10);
    });
}

#[then("exactly one insert reports success")]
fn one_winner(world: &CacheWorld) {
    let outcomes = world.outcomes.borrow();
    assert_eq!(outcomes.len(), 6);
    assert_eq!(outcomes.iter().filter(|o| o.is_inserted()).count(), 1);
}

#[then("every thread observed the winning key")]
fn losers_see_winner(world: &CacheWorld) {
    let winner = world.with_cache(|cache| {
        cache
            .lookup(&external_id("BLDG_1"))
            .expect("lookup")
            .expect("present")
    });
    for outcome in world.outcomes.borrow().iter() {
        if let InsertOutcome::Existing(entry) = outcome {
            assert_eq!(*entry, winner);
        }
    }
    world.with_cache(|cache| cache.shutdown().expect("shutdown"));
}

#[scenario(path = "tests/features/id_cache.feature", index = 0)]
fn overflow_keeps_every_mapping(world: CacheWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/id_cache.feature", index = 1)]
fn concurrent_inserts_have_one_winner(world: CacheWorld) {
    let _ = world;
}
