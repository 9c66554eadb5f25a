//! Per-tick player input storage.
//!
//! The transport layer feeds inputs in; the session reads them back to
//! simulate verified ticks (complete input sets) and predicted ticks (the
//! last known input of each player repeated forward).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fixed::Tick;
use crate::id::PlayerRef;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("player {0:?} is outside this session's {1} players")]
    PlayerOutOfRange(PlayerRef, u16),
    #[error("tick {0} is before the first retained tick {1}")]
    Pruned(Tick, Tick),
    #[error("conflicting input for player {player:?} at tick {tick}")]
    Conflict { tick: Tick, player: PlayerRef },
}

/// Join payload submitted alongside a player's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerJoin {
    pub actor_id: i32,
    pub payload: Vec<u8>,
}

/// One player's input for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInput {
    pub bytes: Vec<u8>,
    pub player_data: Option<PlayerJoin>,
}

impl PlayerInput {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            player_data: None,
        }
    }

    pub fn with_join(mut self, actor_id: i32, payload: Vec<u8>) -> Self {
        self.player_data = Some(PlayerJoin { actor_id, payload });
        self
    }
}

/// All inputs received for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickInputs {
    pub players: BTreeMap<PlayerRef, PlayerInput>,
}

/// Inputs keyed by tick then player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputStore {
    player_count: u16,
    ticks: BTreeMap<Tick, TickInputs>,
    /// Ticks below this have been pruned.
    floor: Tick,
}

impl InputStore {
    pub fn new(player_count: u16) -> Self {
        Self {
            player_count,
            ticks: BTreeMap::new(),
            floor: Tick::MIN,
        }
    }

    pub fn player_count(&self) -> u16 {
        self.player_count
    }

    /// Store an input. Re-submitting an identical input is a no-op; a
    /// different one for the same slot is rejected.
    pub fn insert(
        &mut self,
        tick: Tick,
        player: PlayerRef,
        input: PlayerInput,
    ) -> Result<(), InputError> {
        if player.0 >= self.player_count {
            return Err(InputError::PlayerOutOfRange(player, self.player_count));
        }
        if tick < self.floor {
            return Err(InputError::Pruned(tick, self.floor));
        }
        let slot = self.ticks.entry(tick).or_default();
        match slot.players.get(&player) {
            Some(existing) if *existing != input => Err(InputError::Conflict { tick, player }),
            Some(_) => Ok(()),
            None => {
                slot.players.insert(player, input);
                Ok(())
            }
        }
    }

    pub fn input(&self, tick: Tick, player: PlayerRef) -> Option<&PlayerInput> {
        self.ticks.get(&tick)?.players.get(&player)
    }

    pub fn tick(&self, tick: Tick) -> Option<&TickInputs> {
        self.ticks.get(&tick)
    }

    /// Every player has submitted input for `tick`.
    pub fn is_complete(&self, tick: Tick) -> bool {
        self.ticks
            .get(&tick)
            .is_some_and(|t| t.players.len() == self.player_count as usize)
    }

    /// Last tick of the unbroken run of complete ticks starting right after
    /// `after`. Returns `after` when the next tick is incomplete.
    pub fn verified_through(&self, after: Tick) -> Tick {
        let mut tick = after;
        while self.is_complete(tick + 1) {
            tick += 1;
        }
        tick
    }

    /// Highest tick any input has arrived for.
    pub fn latest_tick(&self) -> Option<Tick> {
        self.ticks.keys().next_back().copied()
    }

    /// Best guess of `player`'s input at `tick`: the real one if present,
    /// otherwise the most recent earlier input, without its join payload.
    pub fn predicted(&self, tick: Tick, player: PlayerRef) -> Option<PlayerInput> {
        if let Some(real) = self.input(tick, player) {
            return Some(real.clone());
        }
        self.ticks
            .range(..tick)
            .rev()
            .find_map(|(_, t)| t.players.get(&player))
            .map(|last| PlayerInput::new(last.bytes.clone()))
    }

    /// Drop every tick before `tick`.
    pub fn prune_before(&mut self, tick: Tick) {
        self.ticks = self.ticks.split_off(&tick);
        self.floor = self.floor.max(tick);
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InputStore {
        InputStore::new(2)
    }

    #[test]
    fn completeness_requires_every_player() {
        let mut s = store();
        s.insert(1, PlayerRef(0), PlayerInput::new([1])).unwrap();
        assert!(!s.is_complete(1));
        s.insert(1, PlayerRef(1), PlayerInput::new([2])).unwrap();
        assert!(s.is_complete(1));
    }

    #[test]
    fn verified_through_stops_at_gap() {
        let mut s = store();
        for t in [1, 2, 4] {
            for p in 0..2 {
                s.insert(t, PlayerRef(p), PlayerInput::new([t as u8])).unwrap();
            }
        }
        assert_eq!(s.verified_through(0), 2);
        assert_eq!(s.verified_through(2), 2);
        assert_eq!(s.verified_through(3), 4);
    }

    #[test]
    fn out_of_range_player_is_rejected() {
        let mut s = store();
        assert_eq!(
            s.insert(0, PlayerRef(2), PlayerInput::default()),
            Err(InputError::PlayerOutOfRange(PlayerRef(2), 2))
        );
    }

    #[test]
    fn conflicting_resubmission_is_rejected() {
        let mut s = store();
        s.insert(3, PlayerRef(0), PlayerInput::new([1])).unwrap();
        assert_eq!(s.insert(3, PlayerRef(0), PlayerInput::new([1])), Ok(()));
        assert!(matches!(
            s.insert(3, PlayerRef(0), PlayerInput::new([2])),
            Err(InputError::Conflict { tick: 3, .. })
        ));
    }

    #[test]
    fn prediction_repeats_last_input_without_join() {
        let mut s = store();
        s.insert(2, PlayerRef(1), PlayerInput::new([7]).with_join(5, vec![0]))
            .unwrap();
        let guess = s.predicted(6, PlayerRef(1)).unwrap();
        assert_eq!(guess.bytes, vec![7]);
        assert!(guess.player_data.is_none());
        assert!(s.predicted(6, PlayerRef(0)).is_none());
        assert!(s.predicted(1, PlayerRef(1)).is_none());
    }

    #[test]
    fn prune_drops_old_ticks_and_rejects_late_input() {
        let mut s = store();
        for t in 0..5 {
            s.insert(t, PlayerRef(0), PlayerInput::new([0])).unwrap();
        }
        s.prune_before(3);
        assert_eq!(s.len(), 2);
        assert_eq!(s.latest_tick(), Some(4));
        assert_eq!(
            s.insert(1, PlayerRef(0), PlayerInput::default()),
            Err(InputError::Pruned(1, 3))
        );
    }
}
