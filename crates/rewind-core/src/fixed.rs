use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
pub type Fixed64 = I32F32;

/// Simulation tick number. Signed to match the frame wire header.
pub type Tick = i32;

/// Convert an f64 to Fixed64. Use only for configuration, never in the sim loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display, never in the sim loop.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Duration of one tick at the given simulation rate (ticks per second).
///
/// Returns zero for a non-positive rate.
pub fn tick_delta(simulation_rate: i32) -> Fixed64 {
    if simulation_rate <= 0 {
        return Fixed64::ZERO;
    }
    Fixed64::from_num(1) / Fixed64::from_num(simulation_rate)
}
