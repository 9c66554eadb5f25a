//! End-to-end session scenarios: prediction and rollback, event
//! reconciliation, resync, instant replay and frame integrity.

use std::cell::RefCell;
use std::rc::Rc;

use rewind_core::event::{DeliveryStatus, EventDelivery};
use rewind_core::fixed::Tick;
use rewind_core::frame::Frame;
use rewind_core::id::PlayerRef;
use rewind_core::input::{InputStore, PlayerInput};
use rewind_core::reconcile::EventKey;
use rewind_core::serialize::{DeserializeError, FramePayload, SerializeMode, frame_from_payload};
use rewind_core::session::{ServiceError, Session, SessionObserver, SessionService};
use rewind_core::system::{System, SystemDecl, SystemError, SystemGroup};
use rewind_core::task::{MainThreadContext, MainThreadUnit, TaskHandle, TaskScheduler};
use rewind_core::test_utils::*;

// ===========================================================================
// Helpers
// ===========================================================================

#[derive(Default)]
struct Recorder {
    deliveries: Vec<EventDelivery>,
    views: Vec<Tick>,
    checksums: Vec<(Tick, u64)>,
}

impl Recorder {
    fn spawned(&self) -> Vec<(Tick, DeliveryStatus, u16)> {
        self.deliveries
            .iter()
            .filter_map(|d| {
                let e = d.decode::<Spawned>()?.ok()?;
                Some((d.tick, d.status, e.player))
            })
            .collect()
    }
}

impl SessionObserver for Recorder {
    fn on_event(&mut self, delivery: &EventDelivery) {
        self.deliveries.push(delivery.clone());
    }

    fn on_update_view(&mut self, frame: &Frame) {
        self.views.push(frame.tick());
    }

    fn on_checksum(&mut self, tick: Tick, checksum: u64) {
        self.checksums.push((tick, checksum));
    }
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

// ===========================================================================
// Simulation
// ===========================================================================

#[test]
fn spawned_entities_move_every_tick() {
    let mut s = game_session();
    let mut store = InputStore::new(2);
    put(&mut store, 1, 0, SPAWN);
    put(&mut store, 1, 1, 0);
    feed_all(&mut store, 2..6, 0);
    s.update(&store, &mut ()).unwrap();

    let frame = s.verified_frame();
    assert_eq!(frame.tick(), 5);
    let positions: Vec<Position> = frame.entities().iter::<Position>().map(|(_, p)| *p).collect();
    assert_eq!(positions.len(), 1);
    // Movement sizes its slices before spawning runs, so the new entity
    // first moves on tick 2.
    assert_eq!(positions[0].x, 4);
}

#[test]
fn update_view_is_called_once_per_update() {
    let mut s = game_session();
    let mut store = InputStore::new(2);
    feed_all(&mut store, 1..4, 0);
    let mut rec = Recorder::default();
    s.update(&store, &mut rec).unwrap();
    s.update(&store, &mut rec).unwrap();
    assert_eq!(rec.views, vec![3, 3]);
}

const PAUSE: u8 = 2;
const RESUME: u8 = 3;

/// Toggles the "physics" group from player input.
#[derive(Default)]
struct PauseSwitch {
    unit: Option<MainThreadUnit>,
}

impl System for PauseSwitch {
    fn name(&self) -> &str {
        "pause-switch"
    }

    fn on_init(
        &mut self,
        _frame: &mut Frame,
        tasks: &mut dyn TaskScheduler,
    ) -> Result<(), SystemError> {
        self.unit = Some(tasks.register_main_thread_unit(
            "pause-switch",
            Box::new(|ctx: &mut MainThreadContext<'_>| {
                let wanted = ctx.frame.inputs().find_map(|(_, bytes)| match bytes.first() {
                    Some(&PAUSE) => Some(false),
                    Some(&RESUME) => Some(true),
                    _ => None,
                });
                if let (Some(enabled), Some(physics)) = (wanted, ctx.systems.find("physics")) {
                    ctx.systems.set_enabled(&mut *ctx.frame, physics, enabled);
                }
                Ok(())
            }),
        ));
        Ok(())
    }

    fn schedule(
        &mut self,
        _frame: &Frame,
        tasks: &mut dyn TaskScheduler,
        incoming: TaskHandle,
    ) -> Result<TaskHandle, SystemError> {
        let unit = self.unit.ok_or_else(|| SystemError::failed("not initialised"))?;
        Ok(tasks.add_main_thread_task(unit, incoming)?)
    }
}

fn x_of_first(frame: &Frame) -> i32 {
    frame
        .entities()
        .iter::<Position>()
        .next()
        .map(|(_, p)| p.x)
        .unwrap()
}

#[test]
fn paused_group_stops_moving_and_the_pause_is_frame_state() {
    init_runtime();
    let systems = vec![
        SystemDecl::system(PauseSwitch::default()),
        SystemDecl::system(SpawnSystem::default()),
        SystemGroup::new("physics")
            .with(MovementSystem::new(2))
            .into(),
    ];
    let mut s = Session::start(test_config(), systems, Vec::new()).unwrap();
    let physics = s.systems().find("physics").unwrap();
    let movement = s.systems().find("movement").unwrap();

    let mut store = InputStore::new(2);
    put(&mut store, 1, 0, SPAWN);
    put(&mut store, 1, 1, 0);
    feed_all(&mut store, 2..4, 0);
    put(&mut store, 4, 0, PAUSE);
    put(&mut store, 4, 1, 0);
    feed_all(&mut store, 5..7, 0);
    s.update(&store, &mut ()).unwrap();

    // Tick 4 already had movement queued when the pause landed.
    let frame = s.verified_frame();
    assert_eq!(x_of_first(frame), 3);
    assert!(!s.systems().is_enabled_in_hierarchy(frame, physics));
    assert!(!s.systems().is_enabled_in_hierarchy(frame, movement));
    assert!(s.systems().is_enabled(frame, movement), "own bit untouched");

    // A predicted resume must not leak into verified state.
    put(&mut store, 7, 0, RESUME);
    s.update(&store, &mut ()).unwrap();
    let predicted = s.predicted_frame().unwrap();
    assert!(s.systems().is_enabled_in_hierarchy(predicted, movement));
    assert!(!s.systems().is_enabled_in_hierarchy(s.verified_frame(), movement));

    put(&mut store, 7, 1, 0);
    feed_all(&mut store, 8..9, 0);
    s.update(&store, &mut ()).unwrap();
    assert_eq!(s.verified_frame().tick(), 8);
    assert_eq!(x_of_first(s.verified_frame()), 4);
}

// ===========================================================================
// Prediction and reconciliation
// ===========================================================================

#[test]
fn wrong_guess_is_canceled_right_guess_is_confirmed() {
    let mut s = game_session();
    let mut store = InputStore::new(2);
    put(&mut store, 1, 0, 0);
    put(&mut store, 1, 1, 0);
    put(&mut store, 2, 0, SPAWN);
    put(&mut store, 2, 1, SPAWN);
    // Tick 3: only player 0 has spoken; player 1 is guessed to spawn again.
    put(&mut store, 3, 0, SPAWN);

    let mut rec = Recorder::default();
    let report = s.update(&store, &mut rec).unwrap();
    assert_eq!((report.verified_ticks, report.predicted_ticks), (2, 1));
    assert_eq!(
        rec.spawned(),
        vec![
            (2, DeliveryStatus::Raised, 0),
            (2, DeliveryStatus::Raised, 1),
            (2, DeliveryStatus::Confirmed, 0),
            (2, DeliveryStatus::Confirmed, 1),
            (3, DeliveryStatus::Raised, 0),
            (3, DeliveryStatus::Raised, 1),
        ]
    );

    // Player 1 did not spawn after all.
    put(&mut store, 3, 1, 0);
    let mut rec = Recorder::default();
    s.update(&store, &mut rec).unwrap();
    let resolved: Vec<_> = rec
        .spawned()
        .into_iter()
        .filter(|(_, status, _)| *status != DeliveryStatus::Raised)
        .collect();
    assert_eq!(
        resolved,
        vec![
            (3, DeliveryStatus::Confirmed, 0),
            (3, DeliveryStatus::Canceled, 1),
        ]
    );
    assert_eq!(s.reconciler().pending_count(), 0);
}

#[test]
fn repeated_prediction_delivers_once() {
    let mut s = game_session();
    let mut store = InputStore::new(2);
    put(&mut store, 1, 0, SPAWN);

    let mut rec = Recorder::default();
    for _ in 0..3 {
        s.update(&store, &mut rec).unwrap();
    }
    assert_eq!(rec.spawned(), vec![(1, DeliveryStatus::Raised, 0)]);
    assert_eq!(s.reconciler().pending_count(), 1);
}

#[test]
fn synced_events_never_come_from_prediction() {
    let mut s = game_session();
    let mut store = InputStore::new(2);
    feed_all(&mut store, 1..10, 0);
    put(&mut store, 10, 0, 0);

    let mut rec = Recorder::default();
    s.update(&store, &mut rec).unwrap();
    let milestones = |rec: &Recorder| {
        rec.deliveries
            .iter()
            .filter_map(|d| d.decode::<Milestone>()?.ok())
            .count()
    };
    assert_eq!(s.current_frame().tick(), 10, "tick 10 was predicted");
    assert_eq!(milestones(&rec), 0);

    put(&mut store, 10, 1, 0);
    let mut rec = Recorder::default();
    s.update(&store, &mut rec).unwrap();
    assert_eq!(milestones(&rec), 1);
}

#[test]
fn dispatcher_sees_what_the_observer_sees() {
    let mut s = game_session();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    s.events()
        .on_typed::<Spawned>(move |tick, status, e| sink.borrow_mut().push((tick, status, e.player)));

    let mut store = InputStore::new(2);
    put(&mut store, 1, 0, SPAWN);
    put(&mut store, 1, 1, 0);
    let mut rec = Recorder::default();
    s.update(&store, &mut rec).unwrap();
    assert_eq!(*seen.borrow(), rec.spawned());
    assert_eq!(seen.borrow().len(), 2);
}

// ===========================================================================
// Resync
// ===========================================================================

struct RebuildCounter(Rc<RefCell<Vec<Tick>>>);

impl SessionService for RebuildCounter {
    fn name(&self) -> &str {
        "rebuild-counter"
    }

    fn reinitialize(&mut self, frame: &Frame) -> Result<(), ServiceError> {
        self.0.borrow_mut().push(frame.tick());
        Ok(())
    }
}

#[test]
fn resync_cancels_pending_events() {
    init_runtime();
    let rebuilt = Rc::new(RefCell::new(Vec::new()));
    let mut s = Session::start(
        test_config(),
        game_systems(),
        vec![Box::new(RebuildCounter(Rc::clone(&rebuilt)))],
    )
    .unwrap();

    let mut store = InputStore::new(2);
    feed_all(&mut store, 1..10, 0);
    put(&mut store, 10, 0, SPAWN);
    s.update(&store, &mut ()).unwrap();
    assert_eq!(s.reconciler().pending_count(), 1);

    let mut authority = game_session();
    let mut other = InputStore::new(2);
    feed_all(&mut other, 1..13, 0);
    authority.update(&other, &mut ()).unwrap();
    let bytes = authority
        .verified_frame()
        .serialize(SerializeMode::Full)
        .unwrap();

    let mut late = Recorder::default();
    s.update(&store, &mut late).unwrap();
    assert!(late.spawned().is_empty(), "already delivered once");
    assert_eq!(s.predicted_frame().map(Frame::tick), Some(10));

    let mut rec = Recorder::default();
    s.resync(&bytes, &mut rec).unwrap();
    assert_eq!(rec.spawned(), vec![(10, DeliveryStatus::Canceled, 0)]);
    assert_eq!(s.reconciler().pending_count(), 0);
    let canceled = &rec.deliveries[0];
    assert!(!s.reconciler().contains(&EventKey::of(10, &canceled.event)));

    assert_eq!(s.verified_frame().tick(), 12);
    assert!(s.predicted_frame().is_none());
    assert_eq!(*rebuilt.borrow(), vec![0, 12]);
    assert_eq!(
        s.verified_frame().calculate_checksum(false).unwrap(),
        authority.verified_frame().calculate_checksum(false).unwrap()
    );
}

#[test]
fn resync_rejects_a_corrupted_frame() {
    let mut s = game_session();
    let mut payload = FramePayload::decompress(
        &s.verified_frame().serialize(SerializeMode::Full).unwrap(),
    )
    .unwrap();
    payload.header.checksum ^= 0xff;
    let bytes = payload.compress(3).unwrap();
    assert!(s.resync(&bytes, &mut ()).is_err());
    assert_eq!(s.verified_frame().tick(), 0);
}

// ===========================================================================
// Frame integrity
// ===========================================================================

#[test]
fn foreign_state_block_fails_checksum() {
    let mut a = game_session();
    let mut b = game_session();
    let mut spawning = InputStore::new(2);
    put(&mut spawning, 1, 0, SPAWN);
    put(&mut spawning, 1, 1, SPAWN);
    let mut idle = InputStore::new(2);
    feed_all(&mut idle, 1..2, 0);
    a.update(&spawning, &mut ()).unwrap();
    b.update(&idle, &mut ()).unwrap();

    let checksum_a = a.verified_frame().calculate_checksum(false).unwrap();
    let checksum_b = b.verified_frame().calculate_checksum(false).unwrap();
    assert_ne!(checksum_a, checksum_b);

    let mut payload =
        FramePayload::decompress(&a.verified_frame().serialize(SerializeMode::Full).unwrap())
            .unwrap();
    let foreign =
        FramePayload::decompress(&b.verified_frame().serialize(SerializeMode::Full).unwrap())
            .unwrap();
    payload.state = foreign.state;

    match frame_from_payload(a.context().clone(), &payload) {
        Err(DeserializeError::ChecksumMismatch { expected, actual }) => {
            assert_eq!(expected, checksum_a);
            assert_eq!(actual, checksum_b);
        }
        other => panic!("expected a checksum mismatch, got {other:?}"),
    }
}

#[test]
fn any_corrupted_state_byte_is_fatal() {
    let mut s = game_session();
    let mut store = InputStore::new(2);
    put(&mut store, 1, 0, SPAWN);
    put(&mut store, 1, 1, SPAWN);
    feed_all(&mut store, 2..4, 0);
    s.update(&store, &mut ()).unwrap();

    let frame = s.verified_frame();
    let checksum = frame.calculate_checksum(false).unwrap();
    let payload =
        FramePayload::decompress(&frame.serialize(SerializeMode::Full).unwrap()).unwrap();
    assert_eq!(payload.header.checksum, checksum);

    let mut named_both = 0;
    for i in 0..payload.state.len() {
        let mut corrupted = payload.clone();
        corrupted.state[i] ^= 0x01;
        let err = match frame_from_payload(s.context().clone(), &corrupted) {
            Ok(_) => panic!("state byte {i} was flipped and the frame still loaded"),
            Err(err) => err,
        };
        if let DeserializeError::ChecksumMismatch { expected, actual } = err {
            assert_eq!(expected, checksum);
            assert_ne!(actual, checksum);
            let text = err.to_string();
            assert!(text.contains(&format!("{expected:#018x}")), "{text}");
            assert!(text.contains(&format!("{actual:#018x}")), "{text}");
            named_both += 1;
        }
    }
    assert!(named_both > 0, "no flip reached the checksum gate");

    // The untouched payload still loads.
    let frame = frame_from_payload(s.context().clone(), &payload).unwrap();
    assert_eq!(frame.calculate_checksum(false).unwrap(), checksum);
}

// ===========================================================================
// Checksums and instant replay
// ===========================================================================

#[test]
fn remote_checksum_mismatch_carries_a_forensic_dump() {
    init_runtime();
    let mut config = test_config();
    config.checksum_interval = 5;
    let mut s = Session::start(config, game_systems(), Vec::new()).unwrap();
    let mut store = InputStore::new(2);
    put(&mut store, 1, 0, SPAWN);
    put(&mut store, 1, 1, 0);
    feed_all(&mut store, 2..13, 0);
    let mut rec = Recorder::default();
    s.update(&store, &mut rec).unwrap();
    assert_eq!(
        rec.checksums.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        vec![5, 10]
    );

    let (tick, local) = rec.checksums[1];
    let err = s.verify_remote_checksum(tick, local.wrapping_add(1)).unwrap_err();
    let dump = err.dump.expect("snapshot at tick 10");
    assert_eq!(dump.snapshot_tick, 10);
    assert_eq!(dump.breakdown.total, local);
    assert!(dump.breakdown.components.iter().any(|(name, _)| name == "Position"));
    let restored = Frame::deserialize(s.context().clone(), &dump.frame_bytes).unwrap();
    assert_eq!(restored.calculate_checksum(false).unwrap(), local);
}

#[test]
fn instant_replay_rebuilds_past_frames() {
    init_runtime();
    let mut config = test_config();
    config.replay_enabled = true;
    config.replay_interval = 5;
    config.replay_window_seconds = 1;
    let mut s = Session::start(config, game_systems(), Vec::new()).unwrap();
    assert!(s.snapshots().is_merged());

    let mut store = InputStore::new(2);
    let mut checksums = Vec::new();
    for t in 1..=20 {
        put(&mut store, t, 0, if t % 3 == 0 { SPAWN } else { 0 });
        put(&mut store, t, 1, if t % 4 == 0 { SPAWN } else { 0 });
        s.update(&store, &mut ()).unwrap();
        checksums.push(s.verified_frame().calculate_checksum(false).unwrap());
    }

    for target in [13, 15, 20] {
        let frame = s.replay_to(target).unwrap();
        assert_eq!(frame.tick(), target);
        assert_eq!(
            frame.calculate_checksum(false).unwrap(),
            checksums[target as usize - 1],
            "tick {target}"
        );
    }
    assert!(s.replay_to(21).is_err());
}
