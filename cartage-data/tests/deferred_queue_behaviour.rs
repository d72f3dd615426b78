//! Behavioural tests for the deferred reference queue.

use std::cell::RefCell;
use std::convert::Infallible;

use cartage_core::test_support::external_id;
use cartage_core::{DeferredKind, InternalKey};
use cartage_data::{CacheTableStore, DeferredGroup, DeferredQueue, DeferredReference};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

struct QueueWorld {
    store: CacheTableStore,
    queue: RefCell<Option<DeferredQueue>>,
}

impl QueueWorld {
    fn with_queue<R>(&self, action: impl FnOnce(&DeferredQueue) -> R) -> R {
        let guard = self.queue.borrow();
        let queue = guard.as_ref().expect("queue must be created first");
        action(queue)
    }

    fn groups(&self) -> Vec<DeferredGroup> {
        self.with_queue(|queue| {
            let mut groups = Vec::new();
            queue
                .stream(DeferredKind::GroupMember, |group| {
                    groups.push(group);
                    Ok::<_, Infallible>(())
                })
                .expect("stream");
            groups
        })
    }
}

#[fixture]
fn world() -> QueueWorld {
    QueueWorld {
        store: CacheTableStore::create(None).expect("create store"),
        queue: RefCell::new(None),
    }
}

fn record_members(world: &QueueWorld, group: i64, members: &[&str]) {
    world.with_queue(|queue| {
        for member in members {
            queue
                .enqueue(DeferredReference::GroupMember {
                    group: InternalKey::new(group),
                    member: external_id(member),
                    role: None,
                    is_parent: false,
                })
                .expect("enqueue");
        }
    });
}

#[given("a deferred queue with batch size 2")]
fn queue(world: &QueueWorld) {
    let created = DeferredQueue::new(&world.store, 2).expect("create queue");
    world.queue.replace(Some(created));
}

#[when("group 7 records members \"A\", \"B\" and \"C\"")]
fn group_seven(world: &QueueWorld) {
    record_members(world, 7, &["A", "B", "C"]);
}

#[when("group 3 records member \"D\"")]
fn group_three(world: &QueueWorld) {
    record_members(world, 3, &["D"]);
}

#[when("the queue is flushed")]
fn flushed(world: &QueueWorld) {
    world.with_queue(|queue| queue.flush().expect("flush"));
}

#[when("every streamed group is marked consumed")]
fn consume_all(world: &QueueWorld) {
    let groups = world.groups();
    world.with_queue(|queue| {
        for group in &groups {
            queue
                .mark_consumed(DeferredKind::GroupMember, &group.seqs())
                .expect("mark consumed");
        }
    });
}

#[then("group member records are streamed for groups 3 and 7 in that order")]
fn streamed_in_key_order(world: &QueueWorld) {
    let sources: Vec<i64> = world
        .groups()
        .iter()
        .map(|group| group.source.get())
        .collect();
    assert_eq!(sources, vec![3, 7]);
}

#[then("group 7 lists members \"A\", \"B\" and \"C\"")]
fn members_in_write_order(world: &QueueWorld) {
    let groups = world.groups();
    let seven = groups
        .iter()
        .find(|group| group.source == InternalKey::new(7))
        .expect("group 7 is streamed");
    let members: Vec<&str> = seven
        .records
        .iter()
        .map(|record| record.reference.target())
        .collect();
    assert_eq!(members, vec!["A", "B", "C"]);
}

#[then("no records are pending")]
fn nothing_pending(world: &QueueWorld) {
    let pending = world.with_queue(|queue| queue.pending().expect("pending"));
    assert!(pending.values().all(|count| *count == 0), "{pending:?}");
}

#[scenario(path = "tests/features/deferred_queue.feature", index = 0)]
fn members_streamed_together(world: QueueWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/deferred_queue.feature", index = 1)]
fn consumed_records_not_pending(world: QueueWorld) {
    let _ = world;
}
