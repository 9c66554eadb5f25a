//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]`.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentRegistry};
use crate::config::SessionConfig;
use crate::event::EventType;
use crate::fixed::Tick;
use crate::frame::{Frame, FrameContext, Globals};
use crate::id::{EventTypeId, PlayerRef};
use crate::input::{InputStore, PlayerInput};
use crate::runtime::{self, InitError, RuntimeSetup};
use crate::system::{System, SystemDecl, SystemError, SystemGraph};
use crate::task::{
    MainThreadContext, MainThreadUnit, SliceUnit, SliceWriter, TaskError, TaskHandle,
    TaskScheduler,
};

/// Enabled-bit slots in frames built by [`test_frame`].
pub const TEST_SYSTEM_SLOTS: usize = 8;

// ===========================================================================
// Components
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Component for Position {
    const NAME: &'static str = "Position";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Velocity {
    pub dx: i32,
    pub dy: i32,
}

impl Component for Velocity {
    const NAME: &'static str = "Velocity";
}

pub fn component_types() -> Arc<ComponentRegistry> {
    let mut registry = ComponentRegistry::new();
    registry.register::<Position>();
    registry.register::<Velocity>();
    Arc::new(registry)
}

/// Initialise the process runtime with the test components. Safe to call
/// from every test.
pub fn init_runtime() {
    let setup = RuntimeSetup::new()
        .component::<Position>()
        .component::<Velocity>();
    match runtime::init_once(setup) {
        Ok(()) | Err(InitError::AlreadyInitialized) => {}
    }
}

// ===========================================================================
// Frames
// ===========================================================================

pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::new("test", 2);
    config.seed = 42;
    config.heap_capacity = 4096;
    config
}

pub fn test_context(config: &SessionConfig) -> Arc<FrameContext> {
    FrameContext::new(component_types(), config, TEST_SYSTEM_SLOTS)
}

pub fn test_frame() -> Frame {
    let config = test_config();
    Frame::new(test_context(&config), Globals::from_config(&config))
}

/// A fresh frame advanced straight to `tick` and marked verified.
pub fn verified_frame_at(tick: Tick) -> Frame {
    let mut frame = test_frame();
    if tick > frame.tick() {
        frame.begin_tick(tick, BTreeMap::new(), true);
    } else {
        frame.set_verified(true);
    }
    frame
}

// ===========================================================================
// Systems
// ===========================================================================

/// Records how often each callback ran.
#[derive(Debug, Default)]
pub struct CountingSystem {
    pub name: String,
    pub init_calls: u32,
    pub enabled_calls: u32,
    pub disabled_calls: u32,
    pub schedule_calls: u32,
    pub fail_schedule: bool,
}

impl CountingSystem {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Counts its calls like any other but fails every `schedule`.
    pub fn failing(name: &str) -> Self {
        Self {
            fail_schedule: true,
            ..Self::new(name)
        }
    }
}

impl System for CountingSystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_init(
        &mut self,
        _frame: &mut Frame,
        _tasks: &mut dyn TaskScheduler,
    ) -> Result<(), SystemError> {
        self.init_calls += 1;
        Ok(())
    }

    fn on_enabled(&mut self, _frame: &mut Frame) -> Result<(), SystemError> {
        self.enabled_calls += 1;
        Ok(())
    }

    fn on_disabled(&mut self, _frame: &mut Frame) -> Result<(), SystemError> {
        self.disabled_calls += 1;
        Ok(())
    }

    fn schedule(
        &mut self,
        _frame: &Frame,
        _tasks: &mut dyn TaskScheduler,
        incoming: TaskHandle,
    ) -> Result<TaskHandle, SystemError> {
        self.schedule_calls += 1;
        if self.fail_schedule {
            return Err(SystemError::failed(format!("{} refuses to schedule", self.name)));
        }
        Ok(incoming)
    }
}

pub fn build_graph(decls: Vec<SystemDecl>) -> SystemGraph {
    SystemGraph::build(decls).unwrap()
}

pub fn empty_graph() -> SystemGraph {
    build_graph(Vec::new())
}

// ===========================================================================
// A small deterministic game
// ===========================================================================

/// Input byte that asks for a new entity.
pub const SPAWN: u8 = 1;

/// Raised when a player's spawn request creates an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spawned {
    pub player: u16,
    pub dy: i32,
}

impl EventType for Spawned {
    const KIND: EventTypeId = EventTypeId(1);
}

/// Raised every tenth tick. Synced, so observers only see verified ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub tick: Tick,
}

impl EventType for Milestone {
    const KIND: EventTypeId = EventTypeId(2);
    const SYNCED: bool = true;
}

/// Spawns an entity per player whose input starts with [`SPAWN`].
#[derive(Debug, Default)]
pub struct SpawnSystem {
    unit: Option<MainThreadUnit>,
}

impl System for SpawnSystem {
    fn name(&self) -> &str {
        "spawn"
    }

    fn on_init(
        &mut self,
        _frame: &mut Frame,
        tasks: &mut dyn TaskScheduler,
    ) -> Result<(), SystemError> {
        let unit = tasks.register_main_thread_unit(
            "spawn",
            Box::new(|ctx: &mut MainThreadContext<'_>| {
                let frame = &mut *ctx.frame;
                let requests: Vec<PlayerRef> = frame
                    .inputs()
                    .filter(|(_, bytes)| bytes.first() == Some(&SPAWN))
                    .map(|(p, _)| p)
                    .collect();
                let tick = frame.tick();
                for player in requests {
                    let dy = frame.globals_mut().rng.next_range(-2, 3);
                    let e = frame.entities_mut().create(tick);
                    frame.entities_mut().set(
                        e,
                        Position {
                            x: player.0 as i32,
                            y: 0,
                        },
                    )?;
                    frame.entities_mut().set(e, Velocity { dx: 1, dy })?;
                    frame
                        .raise(&Spawned {
                            player: player.0,
                            dy,
                        })
                        .map_err(TaskError::failed)?;
                }
                if tick % 10 == 0 {
                    frame.raise(&Milestone { tick }).map_err(TaskError::failed)?;
                }
                Ok(())
            }),
        );
        self.unit = Some(unit);
        Ok(())
    }

    fn schedule(
        &mut self,
        _frame: &Frame,
        tasks: &mut dyn TaskScheduler,
        incoming: TaskHandle,
    ) -> Result<TaskHandle, SystemError> {
        let unit = self
            .unit
            .ok_or_else(|| SystemError::failed("spawn unit not registered"))?;
        Ok(tasks.add_main_thread_task(unit, incoming)?)
    }
}

/// Integrates `Position += Velocity` in parallel slices.
#[derive(Debug)]
pub struct MovementSystem {
    unit: Option<SliceUnit>,
    slices: usize,
}

impl MovementSystem {
    pub fn new(slices: usize) -> Self {
        Self { unit: None, slices }
    }
}

fn integrate(frame: &Frame, range: Range<usize>, writer: &mut SliceWriter) -> Result<(), TaskError> {
    for i in range {
        let (e, pos) = frame
            .entities()
            .component_at::<Position>(i)
            .ok_or_else(|| TaskError::failed(format!("no position at {i}")))?;
        let vel = frame.entities().get::<Velocity>(e).copied().unwrap_or(Velocity { dx: 0, dy: 0 });
        writer.set(
            e,
            Position {
                x: pos.x + vel.dx,
                y: pos.y + vel.dy,
            },
        );
    }
    Ok(())
}

impl System for MovementSystem {
    fn name(&self) -> &str {
        "movement"
    }

    fn on_init(
        &mut self,
        _frame: &mut Frame,
        tasks: &mut dyn TaskScheduler,
    ) -> Result<(), SystemError> {
        self.unit = Some(tasks.register_slice_unit("integrate", Arc::new(integrate)));
        Ok(())
    }

    fn schedule(
        &mut self,
        frame: &Frame,
        tasks: &mut dyn TaskScheduler,
        incoming: TaskHandle,
    ) -> Result<TaskHandle, SystemError> {
        let unit = self
            .unit
            .ok_or_else(|| SystemError::failed("movement unit not registered"))?;
        let count = frame.entities().count::<Position>();
        Ok(tasks.add_array_task(unit, count, incoming, self.slices)?)
    }
}

/// Spawn then move, in that order.
pub fn game_systems() -> Vec<SystemDecl> {
    vec![
        SystemDecl::system(SpawnSystem::default()),
        SystemDecl::system(MovementSystem::new(4)),
    ]
}

/// Insert `byte` for every player at every tick in `ticks`.
pub fn feed_all(store: &mut InputStore, ticks: Range<Tick>, byte: u8) {
    for t in ticks {
        for p in 0..store.player_count() {
            let _ = store.insert(t, PlayerRef(p), PlayerInput::new([byte]));
        }
    }
}
