//! The per-tick orchestrator.
//!
//! A [`Session`] owns the last verified [`Frame`] and drives everything
//! else from it. Each [`Session::update`]:
//!
//! 1. simulates every tick whose inputs are complete on top of the verified
//!    frame, marking the results verified and sampling them into the
//!    snapshot buffers;
//! 2. discards the previous prediction and re-predicts from the new
//!    verified frame up to the newest known input (bounded by
//!    `max_prediction_ticks`);
//! 3. hands the reconciled event deliveries to the dispatcher and the
//!    observer, then calls `on_update_view` once.
//!
//! Rollback therefore never needs an explicit undo: prediction always
//! restarts from a copy of the verified frame.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::checksum::ChecksumError;
use crate::config::{ConfigError, SessionConfig};
use crate::event::{EventDelivery, EventDispatcher};
use crate::fixed::Tick;
use crate::frame::{ChecksumBreakdown, Frame, FrameContext, Globals};
use crate::id::PlayerRef;
use crate::input::{InputError, InputStore, PlayerJoin, TickInputs};
use crate::player::PlayerRecord;
use crate::reconcile::EventReconciler;
use crate::replay::InputRecording;
use crate::runtime;
use crate::serialize::{DeserializeError, SerializeError, SerializeMode};
use crate::signal::PlayerDataSet;
use crate::snapshot::{Sampling, SnapshotBuffers};
use crate::system::{SystemDecl, SystemFailure, SystemGraph};
use crate::task::{RayonTaskGraph, TaskError, TaskReport, TaskScheduler};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    Deserialize(#[from] DeserializeError),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("service {name} failed to reinitialise: {reason}")]
    Service { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

/// A remote checksum disagreed with ours.
#[derive(Debug, Clone, thiserror::Error)]
#[error("checksum mismatch at tick {tick}: local {local:#018x}, remote {remote:#018x}")]
pub struct ChecksumMismatch {
    pub tick: Tick,
    pub local: u64,
    pub remote: u64,
    pub dump: Option<ForensicDump>,
}

/// State captured from the nearest checksum snapshot when a mismatch is
/// detected.
#[derive(Debug, Clone)]
pub struct ForensicDump {
    pub snapshot_tick: Tick,
    pub breakdown: ChecksumBreakdown,
    pub frame_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumVerdict {
    Match,
    /// No local checksum is recorded for that tick (not reached yet, off
    /// the checksum grid, or older than the checksum window).
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("instant replay is disabled for this session")]
    Disabled,
    #[error("tick {tick} is past the last verified tick {verified}")]
    NotVerified { tick: Tick, verified: Tick },
    #[error("no replay snapshot at or before tick {0}")]
    NoSnapshot(Tick),
    #[error("verified inputs for tick {0} are no longer retained")]
    MissingInputs(Tick),
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Receives what a session produces. Every method defaults to a no-op.
pub trait SessionObserver {
    fn on_event(&mut self, _delivery: &EventDelivery) {}

    /// Called once per [`Session::update`] with the newest frame, predicted
    /// or verified.
    fn on_update_view(&mut self, _frame: &Frame) {}

    fn on_checksum(&mut self, _tick: Tick, _checksum: u64) {}

    /// Called when an update advanced the verified frame.
    fn on_verified(&mut self, _frame: &Frame) {}
}

impl SessionObserver for () {}

/// A per-session singleton derived from simulation state (a physics
/// broad-phase, a navigation cache) that must be rebuilt when history is
/// replaced.
pub trait SessionService {
    fn name(&self) -> &str;

    fn reinitialize(&mut self, frame: &Frame) -> Result<(), ServiceError>;
}

/// What one [`Session::update`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub verified_ticks: u32,
    pub predicted_ticks: u32,
    pub deliveries: usize,
    pub system_failures: Vec<SystemFailure>,
    pub task_failures: usize,
}

// ---------------------------------------------------------------------------
// Tick simulation
// ---------------------------------------------------------------------------

/// Outcome of simulating one tick.
#[derive(Debug, Default)]
pub(crate) struct TickOutcome {
    pub(crate) system_failures: Vec<SystemFailure>,
    pub(crate) tasks: TaskReport,
}

fn apply_join(graph: &mut SystemGraph, frame: &mut Frame, player: PlayerRef, join: &PlayerJoin) {
    match PlayerRecord::from_raw(join.actor_id, join.payload.clone()) {
        Ok(record) => {
            frame.players_mut().insert(player, record);
            graph.signal::<PlayerDataSet>(frame, &player);
        }
        Err(e) => warn!(
            "ignoring malformed join payload for player {} at tick {}: {e}",
            player.0,
            frame.tick()
        ),
    }
}

/// Advance `frame` by one tick: install inputs, apply player joins, then
/// schedule and run the system graph to completion.
pub(crate) fn simulate(
    graph: &mut SystemGraph,
    scheduler: &mut dyn TaskScheduler,
    frame: &mut Frame,
    tick: Tick,
    inputs: &TickInputs,
    verified: bool,
) -> TickOutcome {
    let bytes = inputs
        .players
        .iter()
        .map(|(p, i)| (*p, i.bytes.clone()))
        .collect();
    frame.begin_tick(tick, bytes, verified);
    for (player, input) in &inputs.players {
        if let Some(join) = &input.player_data {
            apply_join(graph, frame, *player, join);
        }
    }

    scheduler.begin_frame();
    let system_failures = graph.schedule(frame, scheduler);
    let tasks = scheduler.end_frame(frame, graph);
    trace!(
        "simulated tick {tick} ({}): {} tasks",
        if verified { "verified" } else { "predicted" },
        tasks.tasks_run
    );
    TickOutcome {
        system_failures,
        tasks,
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    config: SessionConfig,
    context: Arc<FrameContext>,
    graph: SystemGraph,
    scheduler: Box<dyn TaskScheduler>,
    services: Vec<Box<dyn SessionService>>,
    verified: Frame,
    predicted: Option<Frame>,
    reconciler: EventReconciler,
    dispatcher: EventDispatcher,
    snapshots: SnapshotBuffers,
    /// Local checksums on the checksum grid, within the checksum window.
    checksums: BTreeMap<Tick, u64>,
    /// Verified inputs still needed to replay from the oldest replay
    /// snapshot.
    replay_inputs: BTreeMap<Tick, TickInputs>,
    recording: Option<InputRecording>,
}

fn reinitialize_services(
    services: &mut [Box<dyn SessionService>],
    frame: &Frame,
) -> Result<(), SessionError> {
    for service in services {
        service
            .reinitialize(frame)
            .map_err(|e| SessionError::Service {
                name: service.name().to_string(),
                reason: e.0,
            })?;
    }
    Ok(())
}

impl Session {
    /// Start a session on the default rayon scheduler.
    pub fn start(
        config: SessionConfig,
        systems: Vec<SystemDecl>,
        services: Vec<Box<dyn SessionService>>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let scheduler = RayonTaskGraph::new(config.thread_count)?;
        Self::start_with_scheduler(config, systems, services, Box::new(scheduler))
    }

    pub fn start_with_scheduler(
        config: SessionConfig,
        systems: Vec<SystemDecl>,
        mut services: Vec<Box<dyn SessionService>>,
        mut scheduler: Box<dyn TaskScheduler>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let components = runtime::components().ok_or(ConfigError::RuntimeNotInitialized)?;
        let mut graph = SystemGraph::build(systems)?;
        let context = FrameContext::new(components, &config, graph.len());

        let mut frame = Frame::new(Arc::clone(&context), Globals::from_config(&config));
        graph.apply_initial_bits(&mut frame);
        let failures = graph.init(&mut frame, scheduler.as_mut());
        if !failures.is_empty() {
            warn!("{} systems failed to initialise", failures.len());
        }
        frame.set_verified(true);

        let checksum = Sampling {
            window: config.checksum_window_ticks(),
            interval: config.checksum_interval,
        };
        let replay = config.replay_enabled.then(|| Sampling {
            window: config.replay_window_ticks(),
            interval: config.replay_interval,
        });
        let mut snapshots = SnapshotBuffers::new(checksum, replay);
        snapshots.push(&frame);

        reinitialize_services(&mut services, &frame)?;
        let recording = if config.record_inputs {
            Some(InputRecording::new(&frame)?)
        } else {
            None
        };

        debug!(
            "session {} started: {} players, {} systems, {} snapshot buffers",
            config.config_id,
            config.player_count,
            graph.len(),
            snapshots.buffer_count()
        );
        Ok(Self {
            config,
            context,
            graph,
            scheduler,
            services,
            verified: frame,
            predicted: None,
            reconciler: EventReconciler::new(),
            dispatcher: EventDispatcher::new(),
            snapshots,
            checksums: BTreeMap::new(),
            replay_inputs: BTreeMap::new(),
            recording,
        })
    }

    // -- Accessors --

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<FrameContext> {
        &self.context
    }

    pub fn verified_frame(&self) -> &Frame {
        &self.verified
    }

    pub fn predicted_frame(&self) -> Option<&Frame> {
        self.predicted.as_ref()
    }

    /// The newest frame: the prediction if there is one.
    pub fn current_frame(&self) -> &Frame {
        self.predicted.as_ref().unwrap_or(&self.verified)
    }

    pub fn systems(&self) -> &SystemGraph {
        &self.graph
    }

    pub fn events(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    pub fn reconciler(&self) -> &EventReconciler {
        &self.reconciler
    }

    pub fn snapshots(&self) -> &SnapshotBuffers {
        &self.snapshots
    }

    pub fn local_checksum(&self, tick: Tick) -> Option<u64> {
        self.checksums.get(&tick).copied()
    }

    pub fn recording(&self) -> Option<&InputRecording> {
        self.recording.as_ref()
    }

    // -- Update --

    fn deliver(&mut self, deliveries: &[EventDelivery], observer: &mut dyn SessionObserver) {
        for delivery in deliveries {
            self.dispatcher.dispatch(delivery);
            observer.on_event(delivery);
        }
    }

    fn absorb(report: &mut UpdateReport, outcome: TickOutcome) {
        report.system_failures.extend(outcome.system_failures);
        report.task_failures += outcome.tasks.failures.len();
    }

    /// Advance verified and predicted state as far as `inputs` allows.
    pub fn update(
        &mut self,
        inputs: &InputStore,
        observer: &mut dyn SessionObserver,
    ) -> Result<UpdateReport, SessionError> {
        let mut report = UpdateReport::default();
        let mut deliveries = Vec::new();

        let start = self.verified.tick();
        let through = inputs.verified_through(start);
        for tick in start + 1..=through {
            let Some(tick_inputs) = inputs.tick(tick) else {
                break;
            };
            self.advance_verified(tick, tick_inputs, &mut report, &mut deliveries, observer)?;
        }
        if through > start {
            observer.on_verified(&self.verified);
        }

        self.predict(inputs, &mut report, &mut deliveries);

        report.deliveries = deliveries.len();
        self.deliver(&deliveries, observer);
        observer.on_update_view(self.current_frame());
        Ok(report)
    }

    fn advance_verified(
        &mut self,
        tick: Tick,
        inputs: &TickInputs,
        report: &mut UpdateReport,
        deliveries: &mut Vec<EventDelivery>,
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let mut next = self.verified.clone();
        let outcome = simulate(
            &mut self.graph,
            self.scheduler.as_mut(),
            &mut next,
            tick,
            inputs,
            true,
        );
        Self::absorb(report, outcome);
        self.reconciler.drain(tick, true, next.take_events(), deliveries);
        self.snapshots.push(&next);

        let interval = self.config.checksum_interval;
        let checksum = if interval > 0 && tick % interval == 0 {
            let checksum = next.checksum()?;
            self.checksums.insert(tick, checksum);
            let oldest = tick - self.config.checksum_window_ticks();
            self.checksums = self.checksums.split_off(&oldest);
            observer.on_checksum(tick, checksum);
            Some(checksum)
        } else {
            None
        };

        if let Some(recording) = &mut self.recording {
            recording.record(tick, inputs.clone(), checksum);
        }
        if let Some(buffer) = self.snapshots.replay_buffer() {
            self.replay_inputs.insert(tick, inputs.clone());
            if let Some(oldest) = buffer.get(0) {
                self.replay_inputs = self.replay_inputs.split_off(&(oldest.tick() + 1));
            }
        }

        self.verified = next;
        report.verified_ticks += 1;
        Ok(())
    }

    fn predict(
        &mut self,
        inputs: &InputStore,
        report: &mut UpdateReport,
        deliveries: &mut Vec<EventDelivery>,
    ) {
        let base = self.verified.tick();
        let horizon = inputs
            .latest_tick()
            .unwrap_or(base)
            .min(base.saturating_add(self.config.max_prediction_ticks));
        if horizon <= base {
            self.predicted = None;
            return;
        }

        let mut frame = self.verified.clone();
        for tick in base + 1..=horizon {
            let guessed = TickInputs {
                players: (0..self.config.player_count)
                    .map(PlayerRef)
                    .filter_map(|p| inputs.predicted(tick, p).map(|i| (p, i)))
                    .collect(),
            };
            let outcome = simulate(
                &mut self.graph,
                self.scheduler.as_mut(),
                &mut frame,
                tick,
                &guessed,
                false,
            );
            Self::absorb(report, outcome);
            self.reconciler.drain(tick, false, frame.take_events(), deliveries);
            report.predicted_ticks += 1;
        }
        self.predicted = Some(frame);
    }

    // -- Resync --

    /// Replace local history with an authoritative serialized frame.
    ///
    /// Pending events are delivered as canceled, snapshot buffers and
    /// recorded checksums are cleared, and every service is rebuilt from
    /// the new frame.
    pub fn resync(
        &mut self,
        bytes: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let mut frame = Frame::deserialize(Arc::clone(&self.context), bytes)?;
        frame.set_verified(true);
        debug!("resync to tick {}", frame.tick());

        let mut canceled = Vec::new();
        self.reconciler.resync(frame.tick(), &mut canceled);
        self.deliver(&canceled, observer);

        self.snapshots.clear();
        self.snapshots.push(&frame);
        self.checksums.clear();
        self.replay_inputs.clear();
        self.predicted = None;
        reinitialize_services(&mut self.services, &frame)?;
        if self.recording.is_some() {
            self.recording = Some(InputRecording::new(&frame)?);
        }
        self.verified = frame;
        Ok(())
    }

    // -- Checksums --

    /// Compare a peer's checksum for `tick` with ours.
    pub fn verify_remote_checksum(
        &self,
        tick: Tick,
        remote: u64,
    ) -> Result<ChecksumVerdict, ChecksumMismatch> {
        let Some(local) = self.local_checksum(tick) else {
            return Ok(ChecksumVerdict::Unknown);
        };
        if local == remote {
            return Ok(ChecksumVerdict::Match);
        }
        error!("checksum mismatch at tick {tick}: local {local:#018x}, remote {remote:#018x}");
        Err(ChecksumMismatch {
            tick,
            local,
            remote,
            dump: self.forensic_dump(tick),
        })
    }

    fn forensic_dump(&self, tick: Tick) -> Option<ForensicDump> {
        let buffer = self.snapshots.checksum_buffer()?;
        let frame = buffer
            .find(tick)
            .or_else(|| buffer.find_at_or_before(tick))
            .or_else(|| buffer.find_closest(tick))?;
        let breakdown = frame
            .checksum_breakdown()
            .map_err(|e| warn!("forensic breakdown failed: {e}"))
            .ok()?;
        let frame_bytes = frame
            .serialize(SerializeMode::Full)
            .map_err(|e| warn!("forensic frame dump failed: {e}"))
            .ok()?;
        Some(ForensicDump {
            snapshot_tick: frame.tick(),
            breakdown,
            frame_bytes,
        })
    }

    // -- Instant replay --

    /// Rebuild the verified frame at `tick` from the nearest earlier replay
    /// snapshot and the retained verified inputs. Events raised along the
    /// way are discarded.
    pub fn replay_to(&mut self, tick: Tick) -> Result<Frame, ReplayError> {
        let verified = self.verified.tick();
        if tick > verified {
            return Err(ReplayError::NotVerified { tick, verified });
        }
        if tick == verified {
            return Ok(self.verified.clone());
        }
        let buffer = self.snapshots.replay_buffer().ok_or(ReplayError::Disabled)?;
        let mut frame = buffer
            .find_at_or_before(tick)
            .ok_or(ReplayError::NoSnapshot(tick))?
            .clone();
        for t in frame.tick() + 1..=tick {
            let inputs = self
                .replay_inputs
                .get(&t)
                .ok_or(ReplayError::MissingInputs(t))?;
            simulate(
                &mut self.graph,
                self.scheduler.as_mut(),
                &mut frame,
                t,
                inputs,
                true,
            );
            frame.take_events();
        }
        Ok(frame)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config_id", &self.config.config_id)
            .field("verified_tick", &self.verified.tick())
            .field("predicted_tick", &self.predicted.as_ref().map(Frame::tick))
            .field("systems", &self.graph.len())
            .field("pending_events", &self.reconciler.pending_count())
            .finish()
    }
}
