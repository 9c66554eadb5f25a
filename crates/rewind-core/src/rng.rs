//! Deterministic PRNG stored in the frame globals.
//!
//! SplitMix64: 8 bytes of state, trivially copied on rollback and hashed
//! into the frame checksum.

use crate::fixed::Fixed64;

/// SplitMix64 pseudo-random number generator.
///
/// Lives inside [`crate::frame::Globals`] so its state rolls back together
/// with the rest of the simulation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate the next `u64` in the sequence.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform integer in `[min, max)`. Returns `min` when the range is empty.
    pub fn next_range(&mut self, min: i32, max: i32) -> i32 {
        if max <= min {
            return min;
        }
        let span = (max as i64 - min as i64) as u64;
        (min as i64 + (self.next_u64() % span) as i64) as i32
    }

    /// Uniform fixed-point value in `[0, 1)`.
    pub fn next_fixed(&mut self) -> Fixed64 {
        // Lower 32 bits of a Q32.32 value are the fractional part.
        Fixed64::from_bits((self.next_u64() >> 32) as i64)
    }

    pub fn state(&self) -> u64 {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = SimRng::new(42);
        let mut b = SimRng::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn range_stays_in_bounds() {
        let mut rng = SimRng::new(7);
        for _ in 0..1000 {
            let v = rng.next_range(-3, 5);
            assert!((-3..5).contains(&v));
        }
        assert_eq!(rng.next_range(4, 4), 4);
    }

    #[test]
    fn fixed_is_below_one() {
        let mut rng = SimRng::new(99);
        for _ in 0..1000 {
            let v = rng.next_fixed();
            assert!(v >= Fixed64::ZERO && v < Fixed64::from_num(1));
        }
    }

    #[test]
    fn cloned_rng_continues_identically() {
        let mut rng = SimRng::new(5);
        for _ in 0..10 {
            rng.next_u64();
        }
        let mut copy = rng.clone();
        assert_eq!(rng.next_u64(), copy.next_u64());
    }
}
