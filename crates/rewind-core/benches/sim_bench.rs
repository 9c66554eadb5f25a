//! Criterion benchmarks for the rewind simulation core.
//!
//! Three benchmark groups:
//! - `verified_tick`: one verified tick over ~1000 moving entities
//! - `rollback`: re-predicting 8 ticks from the verified frame every update
//! - `serialization`: frame serialize/deserialize and checksumming

use criterion::{Criterion, criterion_group, criterion_main};
use rewind_core::fixed::Tick;
use rewind_core::frame::Frame;
use rewind_core::id::PlayerRef;
use rewind_core::input::{InputStore, PlayerInput};
use rewind_core::serialize::SerializeMode;
use rewind_core::session::Session;
use rewind_core::test_utils::*;

// ===========================================================================
// World builders
// ===========================================================================

const SPAWN_TICKS: Tick = 500;

/// A session where both players spawned every tick for `SPAWN_TICKS` ticks,
/// and the store it was fed from.
fn build_world() -> (Session, InputStore) {
    init_runtime();
    let mut session = Session::start(test_config(), game_systems(), Vec::new()).unwrap();
    let mut store = InputStore::new(2);
    feed_all(&mut store, 1..SPAWN_TICKS + 1, SPAWN);
    session.update(&store, &mut ()).unwrap();
    store.prune_before(SPAWN_TICKS);
    (session, store)
}

// ===========================================================================
// Benchmarks
// ===========================================================================

fn bench_verified_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("verified_tick");
    group.sample_size(30);

    let (mut session, mut store) = build_world();
    let mut tick = SPAWN_TICKS;

    group.bench_function("1000_entities", |b| {
        b.iter(|| {
            tick += 1;
            feed_all(&mut store, tick..tick + 1, 0);
            session.update(&store, &mut ()).unwrap();
            store.prune_before(tick);
        });
    });

    group.finish();
}

fn bench_rollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollback");
    group.sample_size(20);

    let (mut session, mut store) = build_world();
    // Player 0 is eight ticks ahead; player 1 never catches up.
    for t in SPAWN_TICKS + 1..=SPAWN_TICKS + 8 {
        store
            .insert(t, PlayerRef(0), PlayerInput::new([0]))
            .unwrap();
    }

    group.bench_function("predict_8_ticks_1000_entities", |b| {
        b.iter(|| {
            session.update(&store, &mut ()).unwrap();
        });
    });

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");
    group.sample_size(30);

    let (session, _) = build_world();
    let frame = session.verified_frame();

    group.bench_function("serialize_full", |b| {
        b.iter(|| {
            frame.serialize(SerializeMode::Full).unwrap();
        });
    });

    group.bench_function("serialize_checksum_mode", |b| {
        b.iter(|| {
            frame.serialize(SerializeMode::Checksum).unwrap();
        });
    });

    let bytes = frame.serialize(SerializeMode::Full).unwrap();
    group.bench_function("deserialize_full", |b| {
        b.iter(|| {
            Frame::deserialize(session.context().clone(), &bytes).unwrap();
        });
    });

    group.bench_function("checksum_shared_serializer", |b| {
        b.iter(|| {
            frame.calculate_checksum(true).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_verified_tick,
    bench_rollback,
    bench_serialization
);
criterion_main!(benches);
