// GEEPAFS FREQUENCY SELECTOR
// PURE: (BOUND, EFFICIENT CLOCK, PROBE UTILIZATION, PROFILE) -> ONE SETTABLE CLOCK.
// NO STATE, NO I/O. SAME INPUTS, SAME DECISION.

use crate::probe::PointAverage;
use crate::tuning::DeviceProfile;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyDecision {
    pub freq_bound: f64,
    pub freq_eff: f64,
    pub freq_cap: Option<f64>,
    pub freq_opt: f64,
    pub target_mhz: u32,
}

// SMALLEST SETTABLE CLOCK NOT BELOW mhz. ROUNDS UP SO THE ASSURANCE BOUND IS
// NEVER UNDERSHOT. ABOVE THE TABLE: THE HIGHEST CLOCK.
pub fn snap_up(candidates: &[u32], mhz: f64) -> Option<u32> {
    candidates
        .iter()
        .copied()
        .find(|&c| c as f64 >= mhz)
        .or_else(|| candidates.last().copied())
}

// assurance x max clock x BUSIEST LADDER POINT'S AVERAGE COMPUTE ACTIVITY
pub fn utilization_cap(assurance: f64, max_mhz: u32, points: &[PointAverage]) -> f64 {
    let busiest = points
        .iter()
        .filter(|p| p.samples > 0)
        .map(|p| p.compute)
        .fold(0.0, f64::max);
    assurance * max_mhz as f64 * busiest
}

pub fn select(
    profile: &DeviceProfile,
    assurance: f64,
    freq_bound: f64,
    freq_eff: f64,
    points: &[PointAverage],
    cap_enabled: bool,
) -> FrequencyDecision {
    let min = profile.min_set_mhz as f64;
    let max = profile.max_mhz as f64;

    let freq_cap = cap_enabled.then(|| utilization_cap(assurance, profile.max_mhz, points));
    let freq_perf = match freq_cap {
        Some(cap) => freq_bound.min(cap),
        None => freq_bound,
    };
    // f64::max/min DROP A NaN OPERAND, SO A NaN BOUND DEGRADES TO THE EFFICIENT CLOCK
    let freq_opt = freq_perf.max(freq_eff).max(min).min(max);

    // VALIDATED PROFILES ALWAYS HAVE CANDIDATES AND CONTAIN max_mhz
    let target_mhz = snap_up(&profile.candidates, freq_opt).unwrap_or(profile.max_mhz);

    FrequencyDecision {
        freq_bound,
        freq_eff,
        freq_cap,
        freq_opt,
        target_mhz,
    }
}
