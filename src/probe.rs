// GEEPAFS PROBE SCHEDULER
// PER-DEVICE STATE MACHINE: WHEN TO PROBE, WHICH LADDER CLOCK TO COMMAND,
// WHICH LADDER CLOCK THE SAMPLE READ THIS TICK WAS MEASURED UNDER.
//
// PHASE ENCODING:
//   1..=N         PROBING. COMMAND LADDER[tri(N - phase)]
//   1-L..=0       MODEL PENDING. HOLD THE LAST PROBE CLOCK, BUILD AT 1-L
//   -L            SETTLE. FIRST IDLE TICK, APPLIES THE NEW TARGET
//   -(L+1)..-98   IDLE COUNTDOWN
//   -99           SATURATED IDLE
//
// N = 2K * SWEEPS PROBE SAMPLES, L = MEASUREMENT LAG IN TICKS. A CLOCK
// COMMANDED AT PHASE P IS MEASURED L TICKS LATER, SO THE SAMPLE READ AT
// PHASE P BELONGS TO TRAVERSAL STEP N - P - L.

use std::time::Duration;

use tracing::debug;

pub const IDLE_FLOOR: i32 = -99;

// TRIANGLE WAVE OVER K LADDER POINTS: 0,1,..,K-1,K-1,..,1,0,0,1,..
pub fn ladder_index(step: usize, ladder_len: usize) -> usize {
    let k = ladder_len.max(1);
    let r = step % (2 * k);
    if r < k { r } else { 2 * k - 1 - r }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeRecord {
    pub ladder_idx: usize,
    pub compute: f64,
    pub mem: f64,
    pub power: f64,
}

// PER-LADDER-POINT AVERAGES OVER ONE PROBE CYCLE
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointAverage {
    pub samples: usize,
    pub compute: f64,
    pub mem: f64,
    pub power: f64,
}

// SAMPLES COLLECTED WHILE PROBING. EACH RECORD CARRIES ITS LADDER INDEX,
// SO A TICK WITH FAILED TELEMETRY LEAVES A GAP INSTEAD OF SHIFTING THE REST.
#[derive(Debug, Clone, Default)]
pub struct ProbeBuffer {
    records: Vec<ProbeRecord>,
}

impl ProbeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: ProbeRecord) {
        self.records.push(record);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProbeRecord] {
        &self.records
    }

    // 0 WHEN EMPTY
    pub fn mem_mean(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.records.iter().map(|r| r.mem).sum::<f64>() / self.records.len() as f64
    }

    // ONE ENTRY PER LADDER POINT. POINTS WITHOUT SAMPLES STAY AT samples == 0.
    pub fn point_averages(&self, ladder_len: usize) -> Vec<PointAverage> {
        let mut points = vec![PointAverage::default(); ladder_len];
        for r in &self.records {
            if let Some(p) = points.get_mut(r.ladder_idx) {
                p.samples += 1;
                p.compute += r.compute;
                p.mem += r.mem;
                p.power += r.power;
            }
        }
        for p in points.iter_mut().filter(|p| p.samples > 0) {
            let n = p.samples as f64;
            p.compute /= n;
            p.mem /= n;
            p.power /= n;
        }
        points
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Probing,
    ModelPending,
    Idle,
}

// WHAT THE DEVICE SHOULD BE RUNNING AT THIS TICK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Probe { ladder_idx: usize },
    Hold { ladder_idx: usize },
    Idle,
}

// RESULT OF THE END-OF-TICK TRANSITION
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Skipped,
    Countdown,
}

#[derive(Debug, Clone)]
pub struct ProbeScheduler {
    phase: i32,
    idle_accum: Duration,
    num_rec: usize,
    ladder_len: usize,
    lag: usize,
    interval: Duration,
    mem_low_threshold: f64,
}

impl ProbeScheduler {
    // STARTS IN PROBING: THE FIRST CYCLE BEGINS ON THE FIRST TICK
    pub fn new(
        ladder_len: usize,
        sweeps: usize,
        lag: usize,
        interval: Duration,
        mem_low_threshold: f64,
    ) -> Self {
        let ladder_len = ladder_len.max(1);
        let num_rec = 2 * ladder_len * sweeps.max(1);
        Self {
            phase: num_rec as i32,
            idle_accum: Duration::ZERO,
            num_rec,
            ladder_len,
            lag: lag.max(1),
            interval,
            mem_low_threshold,
        }
    }

    pub fn phase(&self) -> i32 {
        self.phase
    }

    pub fn num_rec(&self) -> usize {
        self.num_rec
    }

    pub fn idle_accum(&self) -> Duration {
        self.idle_accum
    }

    fn lag_i(&self) -> i32 {
        self.lag as i32
    }

    pub fn state(&self) -> ProbeState {
        if self.phase >= 1 {
            ProbeState::Probing
        } else if self.phase >= 1 - self.lag_i() {
            ProbeState::ModelPending
        } else {
            ProbeState::Idle
        }
    }

    pub fn action(&self) -> TickAction {
        match self.state() {
            ProbeState::Probing => TickAction::Probe {
                ladder_idx: ladder_index(self.num_rec - self.phase as usize, self.ladder_len),
            },
            ProbeState::ModelPending => TickAction::Hold {
                ladder_idx: ladder_index(self.num_rec - 1, self.ladder_len),
            },
            ProbeState::Idle => TickAction::Idle,
        }
    }

    // LADDER INDEX THE CURRENT TICK'S SAMPLE WAS MEASURED UNDER, IF IT BELONGS
    // TO THE RUNNING PROBE CYCLE
    pub fn recording_index(&self) -> Option<usize> {
        let step = self.num_rec as i64 - self.phase as i64 - self.lag as i64;
        if step >= 0 && step < self.num_rec as i64 {
            Some(ladder_index(step as usize, self.ladder_len))
        } else {
            None
        }
    }

    // LAST PENDING TICK: EVERY PROBE SAMPLE IS IN
    pub fn model_due(&self) -> bool {
        self.phase == 1 - self.lag_i()
    }

    // PROBING, PENDING AND THE SETTLE TICK COMMAND. LATER IDLE TICKS DON'T.
    pub fn should_command(&self) -> bool {
        self.phase >= -self.lag_i()
    }

    // END OF TICK. fleet_mem IS THE SUM OF EVERY DEVICE'S MEM MOVING AVERAGE,
    // SO ALL SCHEDULERS START AND SKIP TOGETHER.
    pub fn advance(&mut self, elapsed: Duration, fleet_mem: f64) -> Transition {
        if self.idle_accum >= self.interval {
            self.idle_accum = Duration::ZERO;
            if fleet_mem >= self.mem_low_threshold {
                debug!(target: "geepafs::probe", fleet_mem, "probe cycle start");
                self.phase = self.num_rec as i32;
                return Transition::Started;
            }
            debug!(target: "geepafs::probe", fleet_mem, threshold = self.mem_low_threshold,
                "negligible memory activity, probe skipped");
            // ONE BELOW THE SETTLE TICK: THE OLD TARGET STAYS, NOTHING IS COMMANDED
            self.phase = -self.lag_i() - 1;
            return Transition::Skipped;
        }

        // IDLE TIME ONLY COUNTS ONCE THE CYCLE AND ITS MODEL ARE DONE
        if self.phase >= 1 - self.lag_i() {
            self.idle_accum = Duration::ZERO;
        } else {
            self.idle_accum += elapsed;
        }
        if self.phase > IDLE_FLOOR {
            self.phase -= 1;
        }
        Transition::Countdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(300);

    fn sched(k: usize, sweeps: usize, lag: usize) -> ProbeScheduler {
        ProbeScheduler::new(k, sweeps, lag, Duration::from_millis(1200), 0.03)
    }

    #[test]
    fn triangle_two_sweeps_of_four() {
        let seq: Vec<usize> = (0..16).map(|i| ladder_index(i, 4)).collect();
        assert_eq!(seq, vec![0, 1, 2, 3, 3, 2, 1, 0, 0, 1, 2, 3, 3, 2, 1, 0]);
    }

    #[test]
    fn probe_actions_follow_triangle() {
        let mut s = sched(4, 2, 1);
        assert_eq!(s.num_rec(), 16);
        let mut seq = Vec::new();
        while let TickAction::Probe { ladder_idx } = s.action() {
            seq.push(ladder_idx);
            s.advance(TICK, 1.0);
        }
        assert_eq!(seq, vec![0, 1, 2, 3, 3, 2, 1, 0, 0, 1, 2, 3, 3, 2, 1, 0]);
        assert_eq!(s.state(), ProbeState::ModelPending);
        assert_eq!(s.action(), TickAction::Hold { ladder_idx: 0 });
    }

    #[test]
    fn recorded_samples_lag_commands() {
        for lag in 1..=3 {
            let mut s = sched(3, 1, lag);
            let mut commanded = Vec::new();
            let mut recorded = Vec::new();
            for _ in 0..20 {
                if let Some(idx) = s.recording_index() {
                    recorded.push(idx);
                }
                match s.action() {
                    TickAction::Probe { ladder_idx } | TickAction::Hold { ladder_idx } => {
                        commanded.push(ladder_idx)
                    }
                    TickAction::Idle => {}
                }
                if s.model_due() {
                    break;
                }
                s.advance(TICK, 1.0);
            }
            // EVERY PROBE STEP RECORDED EXACTLY ONCE, UNDER THE CLOCK COMMANDED L TICKS EARLIER
            assert_eq!(recorded.len(), s.num_rec(), "lag {}", lag);
            assert_eq!(&recorded[..], &commanded[..s.num_rec()], "lag {}", lag);
        }
    }

    #[test]
    fn first_tick_has_nothing_to_record() {
        let s = sched(6, 1, 1);
        assert_eq!(s.recording_index(), None);
        assert_eq!(s.action(), TickAction::Probe { ladder_idx: 0 });
    }

    #[test]
    fn settle_tick_commands_then_goes_quiet() {
        let mut s = sched(2, 1, 1);
        // 4 PROBE TICKS
        for _ in 0..4 {
            assert!(s.should_command());
            s.advance(TICK, 1.0);
        }
        assert!(s.model_due());
        assert!(s.should_command());
        s.advance(TICK, 1.0);
        assert_eq!(s.phase(), -1);
        assert_eq!(s.state(), ProbeState::Idle);
        assert!(s.should_command());
        s.advance(TICK, 1.0);
        assert!(!s.should_command());
    }

    #[test]
    fn idle_time_accumulates_only_after_pending() {
        let mut s = sched(2, 1, 1);
        for _ in 0..5 {
            s.advance(TICK, 1.0);
            assert_eq!(s.idle_accum(), Duration::ZERO);
        }
        // PHASE -1 NOW
        s.advance(TICK, 1.0);
        assert_eq!(s.idle_accum(), TICK);
    }

    #[test]
    fn restarts_after_interval_with_activity() {
        let mut s = sched(2, 1, 1);
        let mut started_at = None;
        for tick in 0..40 {
            if s.advance(TICK, 0.5) == Transition::Started {
                started_at = Some(tick);
                break;
            }
        }
        // 5 TICKS TO REACH -1, THEN 4 x 300MS TO FILL THE 1.2S INTERVAL
        assert_eq!(started_at, Some(9));
        assert_eq!(s.phase(), 4);
        assert_eq!(s.idle_accum(), Duration::ZERO);
    }

    #[test]
    fn low_activity_skips_probe() {
        let mut s = sched(2, 1, 1);
        let mut outcome = Transition::Countdown;
        for _ in 0..40 {
            outcome = s.advance(TICK, 0.01);
            if outcome != Transition::Countdown {
                break;
            }
        }
        assert_eq!(outcome, Transition::Skipped);
        assert_eq!(s.phase(), -2);
        assert!(!s.should_command());
        assert_eq!(s.recording_index(), None);
    }

    #[test]
    fn phase_floors_at_minus_99() {
        let mut s = ProbeScheduler::new(2, 1, 1, Duration::from_secs(3600), 0.03);
        for _ in 0..500 {
            s.advance(TICK, 0.0);
        }
        assert_eq!(s.phase(), IDLE_FLOOR);
        assert_eq!(s.action(), TickAction::Idle);
    }

    #[test]
    fn point_averages_skip_gaps() {
        let mut buf = ProbeBuffer::new();
        buf.push(ProbeRecord { ladder_idx: 0, compute: 0.5, mem: 0.2, power: 100.0 });
        buf.push(ProbeRecord { ladder_idx: 0, compute: 0.7, mem: 0.4, power: 120.0 });
        buf.push(ProbeRecord { ladder_idx: 2, compute: 0.9, mem: 0.6, power: 200.0 });
        let pts = buf.point_averages(3);
        assert_eq!(pts[0].samples, 2);
        assert!((pts[0].compute - 0.6).abs() < 1e-12);
        assert!((pts[0].power - 110.0).abs() < 1e-12);
        assert_eq!(pts[1].samples, 0);
        assert!((pts[2].mem - 0.6).abs() < 1e-12);
        assert!((buf.mem_mean() - 0.4).abs() < 1e-12);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.mem_mean(), 0.0);
    }
}
