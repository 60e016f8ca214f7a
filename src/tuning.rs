// GEEPAFS TUNING PARAMETERS
// PURE-RUST MODULE: NO HARDWARE DEPENDENCIES
// DEVICE PROFILES (CLOCK TABLES PER GPU CLASS) AND CONTROL-LOOP CONSTANTS.
// SHARED BETWEEN THE BINARY (main.rs, adaptive.rs) AND THE OFFLINE TESTS.

use serde::Deserialize;
use thiserror::Error;

// --- CONTROL LOOP ---

pub const TICK_PERIOD_MS: u64        = 300;     // MINIMUM WALL TIME PER TICK
pub const TELEMETRY_REFRESH_MS: u64  = 50;      // TELEMETRY CACHE LIFETIME
pub const PROBE_INTERVAL_MS: u64     = 18_000;  // IDLE TIME BETWEEN PROBE CYCLES
pub const PROBE_SWEEPS: usize        = 1;       // UP+DOWN LADDER SWEEPS PER PROBE CYCLE
pub const MEASUREMENT_LAG_TICKS: usize = 1;     // A COMMANDED CLOCK SHOWS UP ONE TICK LATER

// --- MODEL ---

pub const ERR_TOLERANCE_PER_POINT: f64 = 0.01;  // RMS BUDGET PER PROBE SAMPLE
pub const MOVING_AVG_WINDOW: usize     = 16;    // TICKS
pub const MEM_LOW_THRESHOLD: f64       = 0.03;  // BELOW THIS DRAM ACTIVITY, DON'T MODEL

// --- BASELINE POLICIES ---

pub const UTIL_SCALE_PERIOD_TICKS: u64 = 20;

pub const DEFAULT_ASSURANCE_PCT: u8 = 90;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("profile {0}: probe ladder needs at least 2 clocks")]
    LadderTooShort(String),
    #[error("profile {0}: probe ladder is not strictly increasing")]
    LadderNotIncreasing(String),
    #[error("profile {0}: candidate clock list is empty or not strictly increasing")]
    BadCandidates(String),
    #[error("profile {name}: max clock {max_mhz} MHz is not a supported clock")]
    MaxNotSupported { name: String, max_mhz: u32 },
    #[error("profile {name}: min clock {min_mhz} MHz above max clock {max_mhz} MHz")]
    MinAboveMax { name: String, min_mhz: u32, max_mhz: u32 },
    #[error("profile {name}: probe clock {mhz} MHz outside the supported range")]
    LadderOutOfRange { name: String, mhz: u32 },
    #[error("unknown device profile: {0}")]
    Unknown(String),
}

// CLOCK TABLE FOR ONE GPU CLASS. ALL CLOCKS IN MHz.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceProfile {
    pub name: String,
    pub min_set_mhz: u32,       // LOWEST CLOCK THE CONTROLLER WILL EVER PICK
    pub avg_eff_mhz: u32,       // MOST EFFICIENT CLOCK ACROSS TYPICAL WORKLOADS
    pub max_mhz: u32,
    pub mem_mhz: u32,           // APPLICATION MEMORY CLOCK (ONLY ONE ON THESE PARTS)
    pub ladder: Vec<u32>,       // PROBE CLOCKS, ASCENDING
    pub candidates: Vec<u32>,   // EVERY SETTABLE CORE CLOCK, ASCENDING
}

pub const BUILTIN_PROFILES: [&str; 3] = ["v100-maxq", "v100-300w", "a100-insp"];

// V100 CLOCK STEPS ALTERNATE +7/+8 MHz FROM 135
fn v100_clocks(max_mhz: u32) -> Vec<u32> {
    let mut clocks = vec![135u32];
    let mut freq = 135u32;
    let mut seven = true;
    loop {
        freq += if seven { 7 } else { 8 };
        seven = !seven;
        if freq > max_mhz {
            break;
        }
        clocks.push(freq);
    }
    clocks
}

fn stepped_clocks(start: u32, step: u32, max_mhz: u32) -> Vec<u32> {
    (0..).map(|i| start + i * step).take_while(|f| *f <= max_mhz).collect()
}

impl DeviceProfile {
    pub fn builtin(name: &str) -> Result<Self, ProfileError> {
        let profile = match name {
            // V100 MAX-Q, 163 W TDP
            "v100-maxq" => Self {
                name: name.to_string(),
                min_set_mhz: 720,
                avg_eff_mhz: 855,
                max_mhz: 1440,
                mem_mhz: 810,
                ladder: vec![720, 855, 982, 1117, 1245, 1440],
                candidates: v100_clocks(1440),
            },
            // V100 300 W
            "v100-300w" => Self {
                name: name.to_string(),
                min_set_mhz: 952,
                avg_eff_mhz: 952,
                max_mhz: 1530,
                mem_mhz: 877,
                ladder: vec![952, 1147, 1335, 1530],
                candidates: v100_clocks(1530),
            },
            // A100 400 W
            "a100-insp" => Self {
                name: name.to_string(),
                min_set_mhz: 1110,
                avg_eff_mhz: 1110,
                max_mhz: 1410,
                mem_mhz: 1593,
                ladder: vec![1110, 1215, 1320, 1410],
                candidates: stepped_clocks(210, 15, 1410),
            },
            other => return Err(ProfileError::Unknown(other.to_string())),
        };
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        let name = || self.name.clone();
        if self.ladder.len() < 2 {
            return Err(ProfileError::LadderTooShort(name()));
        }
        if self.ladder.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ProfileError::LadderNotIncreasing(name()));
        }
        if self.candidates.is_empty() || self.candidates.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ProfileError::BadCandidates(name()));
        }
        if !self.candidates.contains(&self.max_mhz) {
            return Err(ProfileError::MaxNotSupported { name: name(), max_mhz: self.max_mhz });
        }
        if self.min_set_mhz > self.max_mhz {
            return Err(ProfileError::MinAboveMax {
                name: name(),
                min_mhz: self.min_set_mhz,
                max_mhz: self.max_mhz,
            });
        }
        let lowest = self.candidates[0];
        if let Some(&mhz) = self.ladder.iter().find(|&&f| f < lowest || f > self.max_mhz) {
            return Err(ProfileError::LadderOutOfRange { name: name(), mhz });
        }
        Ok(())
    }

    pub fn ladder_len(&self) -> usize {
        self.ladder.len()
    }

    // PROBE SAMPLES PER CYCLE: EVERY CLOCK TWICE PER SWEEP
    pub fn probe_records(&self, sweeps: usize) -> usize {
        2 * self.ladder.len() * sweeps
    }
}

// CONTROL CONSTANTS, OVERRIDABLE FROM THE [control] TABLE OF THE CONFIG FILE
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlParams {
    pub tick_period_ms: u64,
    pub telemetry_refresh_ms: u64,
    pub probe_interval_ms: u64,
    // ONE SWEEP VISITS EVERY LADDER CLOCK TWICE (UP, THEN DOWN)
    pub sweeps: usize,
    pub err_tolerance: f64,
    pub window: usize,
    pub mem_low_threshold: f64,
    pub freq_cap: bool,
    pub thorough: bool,
    pub util_scale_period: u64,
    pub measurement_lag: usize,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            tick_period_ms: TICK_PERIOD_MS,
            telemetry_refresh_ms: TELEMETRY_REFRESH_MS,
            probe_interval_ms: PROBE_INTERVAL_MS,
            sweeps: PROBE_SWEEPS,
            err_tolerance: ERR_TOLERANCE_PER_POINT,
            window: MOVING_AVG_WINDOW,
            mem_low_threshold: MEM_LOW_THRESHOLD,
            freq_cap: true,
            thorough: false,
            util_scale_period: UTIL_SCALE_PERIOD_TICKS,
            measurement_lag: MEASUREMENT_LAG_TICKS,
        }
    }
}

impl ControlParams {
    // CLAMP NONSENSE TO THE NEAREST WORKABLE VALUE INSTEAD OF REFUSING TO RUN
    pub fn sanitized(mut self) -> Self {
        self.tick_period_ms = self.tick_period_ms.max(1);
        self.sweeps = self.sweeps.max(1);
        self.window = self.window.max(1);
        self.measurement_lag = self.measurement_lag.max(1);
        // UTILIZATION SCALING USES CYCLE TICKS 1 AND 2
        self.util_scale_period = self.util_scale_period.max(3);
        if self.err_tolerance.is_nan() || self.err_tolerance <= 0.0 {
            self.err_tolerance = ERR_TOLERANCE_PER_POINT;
        }
        if self.mem_low_threshold.is_nan() || self.mem_low_threshold < 0.0 {
            self.mem_low_threshold = MEM_LOW_THRESHOLD;
        }
        self
    }
}
