//! Rewind Core -- a deterministic lockstep simulation core with rollback.
//!
//! Given identical per-player inputs, every participant computes
//! bit-identical state. Ticks with incomplete input are predicted and
//! thrown away once the real input arrives; observers are told which of the
//! events they saw actually happened.
//!
//! # Tick Pipeline
//!
//! Each simulated tick, verified or predicted, goes through:
//!
//! 1. **Inputs** -- install the tick's input bytes and apply player joins.
//! 2. **Schedule** -- walk the system graph depth-first; every enabled
//!    system enqueues tasks against the task scheduler.
//! 3. **Run** -- the scheduler runs the task graph to completion
//!    (main-thread, array and threaded tasks).
//! 4. **Reconcile** -- raised events are drained into confirm/cancel
//!    deliveries.
//! 5. **Sample** -- verified frames are offered to the snapshot buffers and
//!    checksummed on the checksum grid.
//!
//! # Setup
//!
//! ```rust,ignore
//! runtime::init_once(RuntimeSetup::new().component::<Position>())?;
//! let mut session = Session::start(config, systems, services)?;
//! session.update(&inputs, &mut observer)?;
//! ```
//!
//! # Key Types
//!
//! - [`session::Session`] -- Orchestrator: verified/predicted ticks, resync,
//!   checksum verification, instant replay.
//! - [`frame::Frame`] -- Complete state of one tick, with block-framed
//!   serialization and checksums.
//! - [`system::SystemGraph`] -- Forest of systems with hierarchical
//!   enablement and signal dispatch.
//! - [`task::TaskScheduler`] -- Task graph contract; [`task::RayonTaskGraph`]
//!   is the default implementation.
//! - [`reconcile::EventReconciler`] -- Confirm/cancel protocol for events.
//! - [`snapshot::SnapshotBuffers`] -- Checksum-audit and replay ring buffers.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point type for deterministic math.

pub mod checksum;
pub mod component;
pub mod config;
pub mod entity;
pub mod event;
pub mod fixed;
pub mod frame;
pub mod heap;
pub mod id;
pub mod input;
pub mod player;
pub mod reconcile;
pub mod replay;
pub mod rng;
pub mod runtime;
pub mod serialize;
pub mod session;
pub mod signal;
pub mod snapshot;
pub mod system;
pub mod task;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
