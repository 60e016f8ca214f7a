// GEEPAFS POLICIES
// ONE STRATEGY PER POLICY, CHOSEN ONCE AT STARTUP. EACH TICK THE CONTROL LOOP
// HANDS EVERY DEVICE'S FRESH SAMPLE TO decide() AND APPLIES THE RETURNED
// COMMAND; end_tick() RUNS ONCE AFTER ALL DEVICES.
//
//   assure             PROBE, MODEL, HOLD THE CHEAPEST CLOCK THAT MEETS THE BOUND
//   max-freq           PIN MAX CLOCK ONCE
//   efficient-fix      PIN THE PROFILE'S AVERAGE-EFFICIENT CLOCK ONCE
//   utilization-scale  EVERY PERIOD: MAX CLOCK, THEN SCALE TO COMPUTE ACTIVITY
//   vendor-default     NEVER TOUCH THE CLOCK

use std::time::Duration;

use clap::ValueEnum;
use tracing::debug;

use crate::gpu::MetricSample;
use crate::model::ModelBuilder;
use crate::probe::{ProbeBuffer, ProbeRecord, ProbeScheduler, TickAction, Transition};
use crate::select::{self, FrequencyDecision};
use crate::smoothing::MovingAverage;
use crate::tuning::{ControlParams, DeviceProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Policy {
    Assure,
    MaxFreq,
    EfficientFix,
    UtilizationScale,
    VendorDefault,
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Assure => "assure",
            Policy::MaxFreq => "max-freq",
            Policy::EfficientFix => "efficient-fix",
            Policy::UtilizationScale => "utilization-scale",
            Policy::VendorDefault => "vendor-default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickContext {
    pub tick: u64,
    pub initial: bool,
}

// mhz: WHERE THE POLICY WANTS THE DEVICE (PRINTED AS setFreq, -1 FOR NONE)
// apply: WHETHER TO ISSUE THE HARDWARE CALL THIS TICK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockCommand {
    pub mhz: Option<u32>,
    pub apply: bool,
}

impl ClockCommand {
    pub const LEAVE: ClockCommand = ClockCommand { mhz: None, apply: false };

    pub fn apply(mhz: u32) -> Self {
        Self { mhz: Some(mhz), apply: true }
    }

    pub fn hold(mhz: u32) -> Self {
        Self { mhz: Some(mhz), apply: false }
    }
}

// EVERYTHING THE LOOP KEEPS PER CONTROLLED GPU
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub id: u32,
    pub mem_avg: MovingAverage,
    pub buffer: ProbeBuffer,
    pub scheduler: ProbeScheduler,
    pub target_mhz: u32,
    pub last_sample: Option<MetricSample>,
    pub set_mhz: Option<u32>,
    // READ AND COMMAND BOTH WENT THROUGH THIS TICK. A FAILED TICK DOES NOT
    // ADVANCE THE PROBE SCHEDULER: THE SAME STEP RUNS AGAIN NEXT TICK.
    pub tick_ok: bool,
    fresh: Option<(&'static str, FrequencyDecision)>,
    // PHASE WHOSE SAMPLE WAS ALREADY RECORDED (AND MODELED, IF DUE)
    handled_phase: Option<i32>,
}

impl DeviceState {
    pub fn new(id: u32, profile: &DeviceProfile, params: &ControlParams) -> Self {
        Self {
            id,
            mem_avg: MovingAverage::new(params.window),
            buffer: ProbeBuffer::new(),
            scheduler: ProbeScheduler::new(
                profile.ladder_len(),
                params.sweeps,
                params.measurement_lag,
                Duration::from_millis(params.probe_interval_ms),
                params.mem_low_threshold,
            ),
            target_mhz: profile.max_mhz,
            last_sample: None,
            set_mhz: None,
            tick_ok: false,
            fresh: None,
            handled_phase: None,
        }
    }

    // DECISION MADE DURING THIS TICK, IF ANY. CLEARED ON READ.
    pub fn take_fresh(&mut self) -> Option<(&'static str, FrequencyDecision)> {
        self.fresh.take()
    }
}

pub trait FrequencyPolicy {
    fn policy(&self) -> Policy;

    fn decide(&mut self, ctx: &TickContext, dev: &mut DeviceState, sample: &MetricSample) -> ClockCommand;

    // background_mem: SUMMED MEM MOVING AVERAGE OF OBSERVED, UNCONTROLLED GPUS
    fn end_tick(&mut self, _devices: &mut [DeviceState], _background_mem: f64, _elapsed: Duration) {}
}

pub fn build_policy(
    policy: Policy,
    profile: &DeviceProfile,
    assurance: f64,
    params: &ControlParams,
) -> Box<dyn FrequencyPolicy> {
    match policy {
        Policy::Assure => Box::new(Assure::new(profile.clone(), assurance, params.clone())),
        Policy::MaxFreq => Box::new(FixedClock { policy, mhz: profile.max_mhz }),
        Policy::EfficientFix => Box::new(FixedClock { policy, mhz: profile.avg_eff_mhz }),
        Policy::UtilizationScale => Box::new(UtilizationScale {
            profile: profile.clone(),
            period: params.util_scale_period,
        }),
        Policy::VendorDefault => Box::new(VendorDefault),
    }
}

// --- ASSURE ---

pub struct Assure {
    profile: DeviceProfile,
    assurance: f64,
    params: ControlParams,
}

impl Assure {
    pub fn new(profile: DeviceProfile, assurance: f64, params: ControlParams) -> Self {
        Self { profile, assurance, params }
    }

    fn rebuild(&self, dev: &mut DeviceState) {
        let outcome = ModelBuilder::new(&self.profile, self.assurance, &self.params).build(dev.id, &dev.buffer);
        let (freq_bound, freq_eff) = outcome.targets(&self.profile);
        let points = dev.buffer.point_averages(self.profile.ladder_len());
        let decision = select::select(
            &self.profile,
            self.assurance,
            freq_bound,
            freq_eff,
            &points,
            self.params.freq_cap,
        );
        if let Some(cap) = decision.freq_cap {
            if freq_bound > cap {
                debug!(target: "geepafs::model", device = dev.id, cap, "clock capped by compute activity");
            }
        }
        debug!(target: "geepafs::model", device = dev.id, outcome = outcome.label(),
            freq_bound, freq_eff, freq_opt = decision.freq_opt, target = decision.target_mhz,
            "frequency decision");
        dev.target_mhz = decision.target_mhz;
        dev.fresh = Some((outcome.label(), decision));
    }
}

impl FrequencyPolicy for Assure {
    fn policy(&self) -> Policy {
        Policy::Assure
    }

    fn decide(&mut self, ctx: &TickContext, dev: &mut DeviceState, sample: &MetricSample) -> ClockCommand {
        dev.mem_avg.push(sample.mem);
        // A RETRIED STEP (LAST TICK'S COMMAND FAILED) WAS ALREADY RECORDED
        let phase = dev.scheduler.phase();
        let retry = dev.handled_phase == Some(phase);
        dev.handled_phase = Some(phase);
        if !retry {
            if let Some(ladder_idx) = dev.scheduler.recording_index() {
                dev.buffer.push(ProbeRecord {
                    ladder_idx,
                    compute: sample.compute,
                    mem: sample.mem,
                    power: sample.power_w,
                });
            }
            if dev.scheduler.model_due() {
                self.rebuild(dev);
            }
        }

        let mhz = match dev.scheduler.action() {
            TickAction::Probe { ladder_idx } | TickAction::Hold { ladder_idx } => self.profile.ladder[ladder_idx],
            TickAction::Idle => dev.target_mhz,
        };
        if ctx.initial || dev.scheduler.should_command() {
            ClockCommand::apply(mhz)
        } else {
            ClockCommand::hold(mhz)
        }
    }

    // SCHEDULERS ADVANCE TOGETHER ON THE FLEET-WIDE MEM ACTIVITY. A DEVICE
    // WHOSE TICK FAILED HOLDS ITS PHASE.
    fn end_tick(&mut self, devices: &mut [DeviceState], background_mem: f64, elapsed: Duration) {
        let fleet_mem: f64 = background_mem + devices.iter().map(|d| d.mem_avg.mean()).sum::<f64>();
        for dev in devices.iter_mut().filter(|d| d.tick_ok) {
            match dev.scheduler.advance(elapsed, fleet_mem) {
                Transition::Started | Transition::Skipped => dev.buffer.clear(),
                Transition::Countdown => {}
            }
        }
    }
}

// --- BASELINES ---

// max-freq AND efficient-fix: ONE COMMAND ON THE FIRST TICK, THEN HANDS OFF
pub struct FixedClock {
    policy: Policy,
    mhz: u32,
}

impl FrequencyPolicy for FixedClock {
    fn policy(&self) -> Policy {
        self.policy
    }

    fn decide(&mut self, ctx: &TickContext, _dev: &mut DeviceState, _sample: &MetricSample) -> ClockCommand {
        if ctx.initial {
            ClockCommand::apply(self.mhz)
        } else {
            ClockCommand::hold(self.mhz)
        }
    }
}

pub struct UtilizationScale {
    profile: DeviceProfile,
    period: u64,
}

impl FrequencyPolicy for UtilizationScale {
    fn policy(&self) -> Policy {
        Policy::UtilizationScale
    }

    // CYCLE TICK 1 RUNS AT MAX CLOCK SO TICK 2 READS UNTHROTTLED UTILIZATION
    fn decide(&mut self, ctx: &TickContext, dev: &mut DeviceState, sample: &MetricSample) -> ClockCommand {
        let max = self.profile.max_mhz;
        match (ctx.tick + 1) % self.period.max(1) {
            1 => ClockCommand::apply(max),
            2 => {
                let want = (sample.compute * max as f64).max(self.profile.min_set_mhz as f64);
                let mhz = select::snap_up(&self.profile.candidates, want).unwrap_or(max);
                debug!(target: "geepafs::model", device = dev.id, compute = sample.compute, mhz,
                    "utilization scaled clock");
                dev.target_mhz = mhz;
                ClockCommand::apply(mhz)
            }
            _ => ClockCommand::LEAVE,
        }
    }
}

pub struct VendorDefault;

impl FrequencyPolicy for VendorDefault {
    fn policy(&self) -> Policy {
        Policy::VendorDefault
    }

    fn decide(&mut self, _ctx: &TickContext, _dev: &mut DeviceState, _sample: &MetricSample) -> ClockCommand {
        ClockCommand::LEAVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maxq() -> DeviceProfile {
        DeviceProfile::builtin("v100-maxq").unwrap()
    }

    fn sample(compute: f64) -> MetricSample {
        MetricSample { compute, mem: 0.3, power_w: 120.0, clock_mhz: 1440 }
    }

    fn ctx(tick: u64) -> TickContext {
        TickContext { tick, initial: tick == 0 }
    }

    #[test]
    fn fixed_clocks_command_once() {
        let p = maxq();
        let params = ControlParams::default();
        let mut dev = DeviceState::new(0, &p, &params);
        let mut max = build_policy(Policy::MaxFreq, &p, 0.9, &params);
        let mut eff = build_policy(Policy::EfficientFix, &p, 0.9, &params);
        assert_eq!(max.decide(&ctx(0), &mut dev, &sample(0.5)), ClockCommand::apply(1440));
        assert_eq!(max.decide(&ctx(1), &mut dev, &sample(0.5)), ClockCommand::hold(1440));
        assert_eq!(eff.decide(&ctx(0), &mut dev, &sample(0.5)), ClockCommand::apply(855));
        assert_eq!(eff.decide(&ctx(7), &mut dev, &sample(0.5)), ClockCommand::hold(855));
    }

    #[test]
    fn vendor_default_never_commands() {
        let p = maxq();
        let params = ControlParams::default();
        let mut dev = DeviceState::new(0, &p, &params);
        let mut policy = build_policy(Policy::VendorDefault, &p, 0.9, &params);
        for tick in 0..5 {
            assert_eq!(policy.decide(&ctx(tick), &mut dev, &sample(1.0)), ClockCommand::LEAVE);
        }
    }

    #[test]
    fn utilization_scale_cycle() {
        let p = maxq();
        let params = ControlParams { util_scale_period: 20, ..ControlParams::default() };
        let mut dev = DeviceState::new(0, &p, &params);
        let mut policy = build_policy(Policy::UtilizationScale, &p, 0.9, &params);
        let got: Vec<ClockCommand> = (0..22).map(|t| policy.decide(&ctx(t), &mut dev, &sample(0.6))).collect();
        assert_eq!(got[0], ClockCommand::apply(1440));
        // 0.6 * 1440 = 864 -> 870
        assert_eq!(got[1], ClockCommand::apply(870));
        assert!(got[2..20].iter().all(|c| *c == ClockCommand::LEAVE));
        assert_eq!(got[20], ClockCommand::apply(1440));
        assert_eq!(got[21], ClockCommand::apply(870));
    }

    #[test]
    fn utilization_scale_respects_floor() {
        let p = maxq();
        let params = ControlParams::default();
        let mut dev = DeviceState::new(0, &p, &params);
        let mut policy = build_policy(Policy::UtilizationScale, &p, 0.9, &params);
        policy.decide(&ctx(0), &mut dev, &sample(0.05));
        assert_eq!(policy.decide(&ctx(1), &mut dev, &sample(0.05)), ClockCommand::apply(720));
    }

    #[test]
    fn assure_probes_from_first_tick() {
        let p = maxq();
        let params = ControlParams::default();
        let mut policy = build_policy(Policy::Assure, &p, 0.9, &params);
        assert_eq!(policy.policy(), Policy::Assure);
        let mut devices = vec![DeviceState::new(0, &p, &params)];
        let mut commanded = Vec::new();
        for tick in 0..12 {
            let cmd = policy.decide(&ctx(tick), &mut devices[0], &sample(0.9));
            assert!(cmd.apply);
            commanded.push(cmd.mhz.unwrap());
            devices[0].tick_ok = true;
            policy.end_tick(&mut devices, 0.0, Duration::from_millis(300));
        }
        assert_eq!(commanded, vec![720, 855, 982, 1117, 1245, 1440, 1440, 1245, 1117, 982, 855, 720]);
        // FIRST TICK HAD NOTHING TO RECORD
        assert_eq!(devices[0].buffer.len(), 11);
        assert_eq!(devices[0].target_mhz, 1440);
    }

    #[test]
    fn failed_tick_holds_phase_without_rerecording() {
        let p = maxq();
        let params = ControlParams::default();
        let mut policy = build_policy(Policy::Assure, &p, 0.9, &params);
        let mut devices = vec![DeviceState::new(0, &p, &params)];
        for tick in 0..3 {
            policy.decide(&ctx(tick), &mut devices[0], &sample(0.9));
            devices[0].tick_ok = true;
            policy.end_tick(&mut devices, 0.0, Duration::from_millis(300));
        }
        assert_eq!(devices[0].buffer.len(), 2);

        // COMMAND FAILED AFTER THIS DECIDE: SAME STEP NEXT TICK
        let first = policy.decide(&ctx(3), &mut devices[0], &sample(0.9));
        devices[0].tick_ok = false;
        policy.end_tick(&mut devices, 0.0, Duration::from_millis(300));
        assert_eq!(devices[0].scheduler.phase(), 9);

        let retry = policy.decide(&ctx(4), &mut devices[0], &sample(0.9));
        assert_eq!(retry, first);
        assert_eq!(retry, ClockCommand::apply(1117));
        assert_eq!(devices[0].buffer.len(), 3);
    }

    #[test]
    fn background_mem_counts_toward_restart() {
        let p = maxq();
        let params = ControlParams { probe_interval_ms: 300, ..ControlParams::default() };
        let mut policy = build_policy(Policy::Assure, &p, 0.9, &params);
        let mut devices = vec![DeviceState::new(0, &p, &params)];
        let idle = MetricSample { compute: 0.0, mem: 0.0, power_w: 40.0, clock_mhz: 1440 };
        // CYCLE, PENDING, SETTLE, THEN THE RESTART CHECK
        for tick in 0..15 {
            policy.decide(&ctx(tick), &mut devices[0], &idle);
            devices[0].tick_ok = true;
            policy.end_tick(&mut devices, 0.5, Duration::from_millis(300));
        }
        assert_eq!(devices[0].scheduler.phase(), 12);
    }

    #[test]
    fn policy_names() {
        assert_eq!(Policy::UtilizationScale.name(), "utilization-scale");
        assert_eq!(Policy::from_str("max-freq", true).unwrap(), Policy::MaxFreq);
    }
}
