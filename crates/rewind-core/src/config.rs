//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::fixed::Tick;

/// Faults that prevent a session from starting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("player count must be between 1 and {max}, got {got}")]
    InvalidPlayerCount { got: u16, max: u16 },
    #[error("simulation rate must be positive, got {0}")]
    InvalidSimulationRate(i32),
    #[error("session config id is missing")]
    MissingConfigId,
    #[error("{name} must not be negative, got {value}")]
    Negative { name: &'static str, value: i32 },
    #[error("compression level {0} is outside 1..=22")]
    InvalidCompressionLevel(i32),
    #[error("runtime was not initialized; call runtime::init_once before starting a session")]
    RuntimeNotInitialized,
    #[error("too many systems: {0} (limit {max})", max = u16::MAX)]
    TooManySystems(usize),
}

/// Everything a session needs to know before its first tick.
///
/// Every participant must use an identical config; `seed` and
/// `simulation_rate` feed directly into the deterministic state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Identifies the content configuration both peers agreed on.
    pub config_id: String,
    /// Ticks per second.
    pub simulation_rate: i32,
    pub player_count: u16,
    pub seed: u64,
    /// Record and compare a checksum every this many verified ticks.
    /// Zero disables checksum auditing.
    pub checksum_interval: i32,
    /// How far back checksum snapshots are kept, in seconds.
    pub checksum_window_seconds: i32,
    pub replay_enabled: bool,
    /// Snapshot interval for instant replay, in ticks.
    pub replay_interval: i32,
    pub replay_window_seconds: i32,
    /// Longest stretch the session predicts past the last verified tick.
    pub max_prediction_ticks: i32,
    /// Reuse one scratch buffer for all checksums of this session. Must be
    /// off when checksums can be taken from more than one thread.
    pub allow_shared_checksum_serializer: bool,
    /// zstd level for serialized frames.
    pub compression_level: i32,
    pub heap_capacity: usize,
    /// Worker threads for the default task scheduler; 0 picks a default.
    pub thread_count: usize,
    /// Keep an input recording of the whole session.
    pub record_inputs: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            config_id: String::new(),
            simulation_rate: 60,
            player_count: 2,
            seed: 0,
            checksum_interval: 60,
            checksum_window_seconds: 3,
            replay_enabled: false,
            replay_interval: 30,
            replay_window_seconds: 10,
            max_prediction_ticks: 8,
            allow_shared_checksum_serializer: true,
            compression_level: 3,
            heap_capacity: 1 << 20,
            thread_count: 0,
            record_inputs: false,
        }
    }
}

/// Upper bound on players in one session.
pub const MAX_PLAYERS: u16 = 64;

impl SessionConfig {
    pub fn new(config_id: impl Into<String>, player_count: u16) -> Self {
        Self {
            config_id: config_id.into(),
            player_count,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.player_count == 0 || self.player_count > MAX_PLAYERS {
            return Err(ConfigError::InvalidPlayerCount {
                got: self.player_count,
                max: MAX_PLAYERS,
            });
        }
        if self.config_id.trim().is_empty() {
            return Err(ConfigError::MissingConfigId);
        }
        if self.simulation_rate <= 0 {
            return Err(ConfigError::InvalidSimulationRate(self.simulation_rate));
        }
        for (name, value) in [
            ("checksum_interval", self.checksum_interval),
            ("checksum_window_seconds", self.checksum_window_seconds),
            ("replay_interval", self.replay_interval),
            ("replay_window_seconds", self.replay_window_seconds),
            ("max_prediction_ticks", self.max_prediction_ticks),
        ] {
            if value < 0 {
                return Err(ConfigError::Negative { name, value });
            }
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(ConfigError::InvalidCompressionLevel(self.compression_level));
        }
        Ok(())
    }

    pub fn checksum_window_ticks(&self) -> Tick {
        self.checksum_window_seconds.saturating_mul(self.simulation_rate)
    }

    pub fn replay_window_ticks(&self) -> Tick {
        self.replay_window_seconds.saturating_mul(self.simulation_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_with_id_are_valid() {
        assert_eq!(SessionConfig::new("arena", 4).validate(), Ok(()));
    }

    #[test]
    fn missing_config_id_is_fatal() {
        let cfg = SessionConfig::new("  ", 2);
        assert_eq!(cfg.validate(), Err(ConfigError::MissingConfigId));
    }

    #[test]
    fn player_count_bounds() {
        assert!(matches!(
            SessionConfig::new("a", 0).validate(),
            Err(ConfigError::InvalidPlayerCount { got: 0, .. })
        ));
        assert!(SessionConfig::new("a", MAX_PLAYERS + 1).validate().is_err());
        assert!(SessionConfig::new("a", MAX_PLAYERS).validate().is_ok());
    }

    #[test]
    fn negative_interval_names_the_field() {
        let cfg = SessionConfig {
            replay_interval: -1,
            ..SessionConfig::new("a", 1)
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Negative {
                name: "replay_interval",
                value: -1
            })
        );
    }

    #[test]
    fn windows_convert_to_ticks() {
        let cfg = SessionConfig {
            simulation_rate: 30,
            checksum_window_seconds: 6,
            replay_window_seconds: 2,
            ..SessionConfig::new("a", 1)
        };
        assert_eq!(cfg.checksum_window_ticks(), 180);
        assert_eq!(cfg.replay_window_ticks(), 60);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"config_id":"x","player_count":3}"#).unwrap();
        assert_eq!(cfg.player_count, 3);
        assert_eq!(cfg.simulation_rate, 60);
    }
}
