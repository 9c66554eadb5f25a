//! Input recording and playback for desync debugging.
//!
//! An [`InputRecording`] captures the verified frame a session started (or
//! last resynced) from, every verified tick's inputs after it, and the
//! checksums the session recorded along the way. [`play_back`] feeds the
//! inputs through a fresh session and reports the first checkpoint whose
//! checksum differs.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::fixed::Tick;
use crate::frame::Frame;
use crate::input::{InputStore, TickInputs};
use crate::serialize::{DeserializeError, SerializeError, SerializeMode};
use crate::session::{Session, SessionError};
use crate::system::SystemDecl;

// ---------------------------------------------------------------------------
// InputRecording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecording {
    /// Full serialization of the frame recording starts from.
    pub initial_frame: Vec<u8>,
    pub start_tick: Tick,
    /// Verified inputs in tick order.
    pub inputs: Vec<(Tick, TickInputs)>,
    /// (tick, checksum) pairs recorded by the session.
    pub checkpoints: Vec<(Tick, u64)>,
}

impl InputRecording {
    pub fn new(frame: &Frame) -> Result<Self, SerializeError> {
        Ok(Self {
            initial_frame: frame.serialize(SerializeMode::Full)?,
            start_tick: frame.tick(),
            inputs: Vec::new(),
            checkpoints: Vec::new(),
        })
    }

    pub fn record(&mut self, tick: Tick, inputs: TickInputs, checksum: Option<u64>) {
        debug_assert!(
            self.inputs.last().is_none_or(|(t, _)| *t < tick),
            "ticks must be recorded in order"
        );
        self.inputs.push((tick, inputs));
        if let Some(checksum) = checksum {
            self.checkpoints.push((tick, checksum));
        }
    }

    pub fn tick_count(&self) -> usize {
        self.inputs.len()
    }

    /// Last recorded tick, or the start tick when nothing was recorded.
    pub fn last_tick(&self) -> Tick {
        self.inputs.last().map_or(self.start_tick, |(t, _)| *t)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        bitcode::serialize(self).map_err(|e| SerializeError::Encode {
            block: "recording",
            reason: e.to_string(),
        })
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DeserializeError> {
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode {
            block: "recording",
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Where playback diverged from the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayMismatch {
    pub tick: Tick,
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResult {
    pub ticks_simulated: usize,
    pub checkpoints_checked: usize,
    pub first_mismatch: Option<ReplayMismatch>,
}

impl ReplayResult {
    pub fn is_verified(&self) -> bool {
        self.first_mismatch.is_none()
    }
}

/// Re-simulate `recording` with `systems` and compare every checkpoint.
///
/// `config` must match the recording session's config; input recording is
/// switched off for the playback session.
pub fn play_back(
    recording: &InputRecording,
    mut config: SessionConfig,
    systems: Vec<SystemDecl>,
) -> Result<ReplayResult, SessionError> {
    config.record_inputs = false;
    let player_count = config.player_count;
    let mut session = Session::start(config, systems, Vec::new())?;
    session.resync(&recording.initial_frame, &mut ())?;

    let mut store = InputStore::new(player_count);
    let mut checkpoints = recording.checkpoints.iter().peekable();
    let mut result = ReplayResult {
        ticks_simulated: 0,
        checkpoints_checked: 0,
        first_mismatch: None,
    };

    for (tick, inputs) in &recording.inputs {
        for (player, input) in &inputs.players {
            store.insert(*tick, *player, input.clone())?;
        }
        let report = session.update(&store, &mut ())?;
        result.ticks_simulated += report.verified_ticks as usize;
        store.prune_before(*tick);

        while let Some(&&(at, expected)) = checkpoints.peek()
            && at <= *tick
        {
            checkpoints.next();
            if at != *tick || session.verified_frame().tick() != at {
                continue;
            }
            let actual = session.verified_frame().calculate_checksum(false)?;
            result.checkpoints_checked += 1;
            if actual != expected && result.first_mismatch.is_none() {
                result.first_mismatch = Some(ReplayMismatch {
                    tick: at,
                    expected,
                    actual,
                });
            }
        }
    }
    Ok(result)
}

// ===========================================================================
// Tests
// ===========================================================================
