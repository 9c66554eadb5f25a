//! Property-based tests for the rewind core.
//!
//! Uses proptest to generate input scripts and event histories, then checks
//! that determinism, frame round-trips, snapshot sizing and event
//! reconciliation hold for all of them.

use std::collections::BTreeMap;

use proptest::prelude::*;
use rewind_core::event::{DeliveryStatus, Event, EventDelivery, EventType};
use rewind_core::fixed::Tick;
use rewind_core::frame::Frame;
use rewind_core::id::{EventTypeId, PlayerRef};
use rewind_core::input::{InputStore, PlayerInput};
use rewind_core::reconcile::EventReconciler;
use rewind_core::serialize::SerializeMode;
use rewind_core::session::Session;
use rewind_core::snapshot::{FrameSnapshotBuffer, get_size};
use rewind_core::test_utils::*;
use serde::{Deserialize, Serialize};

// ===========================================================================
// Generators
// ===========================================================================

/// Per-tick input bytes for two players. Roughly one tick in four spawns.
fn arb_script(max_ticks: usize) -> impl Strategy<Value = Vec<(u8, u8)>> {
    let byte = prop_oneof![3 => Just(0u8), 1 => Just(SPAWN)];
    proptest::collection::vec((byte.clone(), byte), 1..=max_ticks)
}

fn game_session() -> Session {
    init_runtime();
    Session::start(test_config(), game_systems(), Vec::new()).unwrap()
}

fn put(store: &mut InputStore, tick: Tick, player: u16, byte: u8) {
    store
        .insert(tick, PlayerRef(player), PlayerInput::new([byte]))
        .unwrap();
}

/// Feed the whole script at once.
fn run_at_once(script: &[(u8, u8)]) -> Session {
    let mut s = game_session();
    let mut store = InputStore::new(2);
    for (i, &(a, b)) in script.iter().enumerate() {
        put(&mut store, i as Tick + 1, 0, a);
        put(&mut store, i as Tick + 1, 1, b);
    }
    s.update(&store, &mut ()).unwrap();
    s
}

#[derive(Serialize, Deserialize)]
struct Hit(u8);

impl EventType for Hit {
    const KIND: EventTypeId = EventTypeId(7);
}

fn hits(mask: u8) -> Vec<Event> {
    (0..4u8)
        .filter(|v| mask & (1 << v) != 0)
        .map(|v| Event::encode(&Hit(v)).unwrap())
        .collect()
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Two sessions fed the same inputs agree on every verified tick.
    #[test]
    fn identical_inputs_identical_checksums(script in arb_script(30)) {
        let mut a = game_session();
        let mut b = game_session();
        let mut store = InputStore::new(2);
        for (i, &(x, y)) in script.iter().enumerate() {
            let t = i as Tick + 1;
            put(&mut store, t, 0, x);
            put(&mut store, t, 1, y);
            a.update(&store, &mut ()).unwrap();
            b.update(&store, &mut ()).unwrap();
            prop_assert_eq!(
                a.verified_frame().calculate_checksum(false).unwrap(),
                b.verified_frame().calculate_checksum(false).unwrap()
            );
        }
    }

    /// Lagging input forces predictions and rollbacks, but the verified
    /// result matches a session that never had to guess.
    #[test]
    fn rollback_converges(script in arb_script(30), lag in 1usize..5) {
        let reference = run_at_once(&script);

        let mut s = game_session();
        let mut store = InputStore::new(2);
        for (i, &(x, _)) in script.iter().enumerate() {
            put(&mut store, i as Tick + 1, 0, x);
            if let Some(j) = i.checked_sub(lag) {
                put(&mut store, j as Tick + 1, 1, script[j].1);
            }
            s.update(&store, &mut ()).unwrap();
        }
        for j in script.len().saturating_sub(lag)..script.len() {
            put(&mut store, j as Tick + 1, 1, script[j].1);
        }
        s.update(&store, &mut ()).unwrap();

        prop_assert_eq!(s.verified_frame().tick(), script.len() as Tick);
        prop_assert!(s.predicted_frame().is_none());
        prop_assert_eq!(
            s.verified_frame().calculate_checksum(false).unwrap(),
            reference.verified_frame().calculate_checksum(false).unwrap()
        );
        prop_assert_eq!(s.reconciler().pending_count(), 0);
    }

    /// Serializing and deserializing a verified frame preserves its checksum
    /// in both modes.
    #[test]
    fn frame_round_trip(script in arb_script(20)) {
        let s = run_at_once(&script);
        let frame = s.verified_frame();
        let expected = frame.calculate_checksum(false).unwrap();
        for mode in [SerializeMode::Full, SerializeMode::Checksum] {
            let bytes = frame.serialize(mode).unwrap();
            let back = Frame::deserialize(s.context().clone(), &bytes).unwrap();
            prop_assert_eq!(back.tick(), frame.tick());
            prop_assert_eq!(back.entities().len(), frame.entities().len());
            prop_assert_eq!(back.calculate_checksum(false).unwrap(), expected);
        }
    }

    /// A ring holds `get_size(window, interval)` frames, newest last, one per
    /// interval.
    #[test]
    fn snapshot_ring_keeps_the_newest_window(
        window in 0i32..120,
        interval in 1i32..15,
        last in 0i32..200,
    ) {
        let mut buf = FrameSnapshotBuffer::new(window, interval);
        prop_assert_eq!(buf.capacity(), get_size(window, interval));
        prop_assert_eq!(buf.capacity(), 1 + (window / interval) as usize);

        for t in 0..=last {
            buf.push(&verified_frame_at(t));
        }
        let on_grid = (last / interval + 1) as usize;
        prop_assert_eq!(buf.len(), on_grid.min(buf.capacity()));
        prop_assert_eq!(buf.latest().map(Frame::tick), Some(last - last % interval));
        let ticks: Vec<Tick> = buf.iter().map(Frame::tick).collect();
        for pair in ticks.windows(2) {
            prop_assert_eq!(pair[1] - pair[0], interval);
        }
    }

    /// Every raised occurrence is resolved exactly once, in tick order, and
    /// confirmed exactly when the verified pass raised it too.
    #[test]
    fn reconciliation_resolves_each_occurrence_once(
        verified in proptest::collection::vec(0u8..16, 1..20),
        predicted in proptest::collection::vec(0u8..16, 60),
    ) {
        let n = verified.len() as Tick;
        let mut rec = EventReconciler::new();
        let mut out: Vec<EventDelivery> = Vec::new();
        for t in 1..=n {
            // Predict up to two ticks ahead, then verify `t`.
            for (k, ahead) in (t..=(t + 2).min(n)).enumerate() {
                let mask = predicted[((t as usize - 1) * 3 + k) % predicted.len()];
                rec.drain(ahead, false, hits(mask), &mut out);
            }
            rec.drain(t, true, hits(verified[t as usize - 1]), &mut out);
        }
        prop_assert_eq!(rec.pending_count(), 0);

        let mut raised: BTreeMap<(Tick, u8), usize> = BTreeMap::new();
        let mut resolved: BTreeMap<(Tick, u8), DeliveryStatus> = BTreeMap::new();
        let mut last_resolution = 0;
        for d in &out {
            let Hit(v) = d.decode::<Hit>().unwrap().unwrap();
            match d.status {
                DeliveryStatus::Raised => *raised.entry((d.tick, v)).or_default() += 1,
                status => {
                    prop_assert!(d.tick >= last_resolution);
                    last_resolution = d.tick;
                    prop_assert!(resolved.insert((d.tick, v), status).is_none());
                }
            }
        }
        prop_assert!(raised.values().all(|&c| c == 1));
        prop_assert_eq!(
            raised.keys().collect::<Vec<_>>(),
            resolved.keys().collect::<Vec<_>>()
        );
        for (&(tick, v), &status) in &resolved {
            let real = verified[tick as usize - 1] & (1 << v) != 0;
            let want = if real { DeliveryStatus::Confirmed } else { DeliveryStatus::Canceled };
            prop_assert_eq!(status, want);
        }
    }
}
