// GEEPAFS MODEL BUILDER
// TURNS ONE PROBE CYCLE INTO A PERFORMANCE MODEL (MEM ACTIVITY VS CORE CLOCK),
// THEN DERIVES THE PERFORMANCE-ASSURANCE BOUND AND THE MOST EFFICIENT CLOCK.
//
// CANDIDATES: ONE STRAIGHT LINE, PLUS ONE FOLD-LINE PER INTERIOR BREAKPOINT
// (2 <= turn <= K-2, SO BOTH SEGMENTS SPAN AT LEAST 2 LADDER CLOCKS).
// FOLD-LINES MUST BEND DOWN (slope1 > slope2). LOWEST RMS RESIDUAL WINS.
// A DEGENERATE FIT DROPS ITS CANDIDATE. NOTHING HERE PANICS OR RETURNS NaN.

use tracing::debug;

use crate::probe::{PointAverage, ProbeBuffer, ProbeRecord};
use crate::regression::{self, FitError, FoldFit, LineFit};
use crate::tuning::{ControlParams, DeviceProfile};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PerfModel {
    Linear(LineFit),
    // turn = NUMBER OF LADDER CLOCKS ON THE LOWER SEGMENT
    FoldLine { fit: FoldFit, turn: usize },
}

impl PerfModel {
    pub fn err(&self) -> f64 {
        match self {
            PerfModel::Linear(l) => l.err,
            PerfModel::FoldLine { fit, .. } => fit.err,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PerfModel::Linear(_) => "linear",
            PerfModel::FoldLine { .. } => "fold-line",
        }
    }

    // NON-POSITIVE SLOPE: PERFORMANCE ALREADY SATURATED AT THE LOWEST PROBE CLOCK.
    // A DOWNWARD UPPER SEGMENT HOLDS ITS PEAK FROM THE CROSSOVER ON.
    fn estimate(&self, mhz: f64, upper: bool, floor_mhz: f64) -> f64 {
        match *self {
            PerfModel::Linear(l) => {
                if l.slope > 0.0 { l.eval(mhz) } else { l.eval(floor_mhz) }
            }
            PerfModel::FoldLine { fit, .. } => {
                let lower = |x: f64| fit.slope1 * x + fit.intercept1;
                if fit.slope1 <= 0.0 {
                    lower(floor_mhz)
                } else if !upper {
                    lower(mhz)
                } else if fit.slope2 > 0.0 {
                    fit.slope2 * mhz + fit.intercept2
                } else {
                    lower(fit.cross)
                }
            }
        }
    }

    // MODELED PERFORMANCE AT LADDER POINT idx. SEGMENT CHOSEN BY LADDER POSITION.
    pub fn perf_at_probe(&self, idx: usize, ladder: &[u32]) -> f64 {
        let floor = ladder.first().copied().unwrap_or(0) as f64;
        let mhz = ladder.get(idx).copied().unwrap_or(0) as f64;
        let upper = match self {
            PerfModel::Linear(_) => false,
            PerfModel::FoldLine { turn, .. } => idx >= *turn,
        };
        self.estimate(mhz, upper, floor)
    }

    // MODELED PERFORMANCE AT ANY CLOCK. SEGMENT CHOSEN BY THE CROSSOVER.
    pub fn perf_at(&self, mhz: f64, floor_mhz: f64) -> f64 {
        let upper = match self {
            PerfModel::Linear(_) => false,
            PerfModel::FoldLine { fit, .. } => mhz >= fit.cross,
        };
        self.estimate(mhz, upper, floor_mhz)
    }

    // LOWEST CLOCK WHOSE MODELED PERFORMANCE REACHES assurance x (PERFORMANCE AT
    // max_mhz, OR AT THE PEAK FOR A MODEL THAT TOPS OUT BEFORE max_mhz).
    pub fn perf_bound(&self, assurance: f64, max_mhz: f64, floor_mhz: f64) -> f64 {
        match *self {
            PerfModel::Linear(l) => {
                if l.slope > 0.0 {
                    (assurance * l.eval(max_mhz) - l.intercept) / l.slope
                } else {
                    floor_mhz
                }
            }
            PerfModel::FoldLine { fit, .. } => {
                if fit.slope1 <= 0.0 {
                    return floor_mhz;
                }
                if fit.slope2 > 0.0 {
                    let critical = assurance * (fit.slope2 * max_mhz + fit.intercept2);
                    let on_upper = (critical - fit.intercept2) / fit.slope2;
                    if on_upper > fit.cross {
                        on_upper
                    } else {
                        (critical - fit.intercept1) / fit.slope1
                    }
                } else {
                    let critical = assurance * (fit.slope1 * fit.cross + fit.intercept1);
                    (critical - fit.intercept1) / fit.slope1
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelOutcome {
    Modeled { model: PerfModel, freq_bound: f64, freq_eff: f64 },
    // MEM ACTIVITY TOO LOW TO TRUST A MODEL. NOT AN ERROR.
    LowActivity { mem_mean: f64 },
    // NO CANDIDATE FIT THE DATA WITHIN BUDGET, OR A DERIVED CLOCK WAS NOT FINITE
    Rejected { best_err: f64 },
}

impl ModelOutcome {
    // (freq_bound, freq_eff). ANYTHING BUT A MODEL FALLS BACK TO MAX CLOCK
    // FOR ASSURANCE AND THE PROFILE'S AVERAGE-EFFICIENT CLOCK.
    pub fn targets(&self, profile: &DeviceProfile) -> (f64, f64) {
        match *self {
            ModelOutcome::Modeled { freq_bound, freq_eff, .. } => (freq_bound, freq_eff),
            _ => (profile.max_mhz as f64, profile.avg_eff_mhz as f64),
        }
    }

    pub fn model(&self) -> Option<&PerfModel> {
        match self {
            ModelOutcome::Modeled { model, .. } => Some(model),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelOutcome::Modeled { model, .. } => model.kind(),
            ModelOutcome::LowActivity { .. } => "low-activity",
            ModelOutcome::Rejected { .. } => "rejected",
        }
    }
}

fn partition(ladder: &[u32], records: &[ProbeRecord], turn: usize) -> [Vec<f64>; 4] {
    let (mut lx, mut ly, mut ux, mut uy) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
    for r in records {
        let x = ladder[r.ladder_idx] as f64;
        if r.ladder_idx < turn {
            lx.push(x);
            ly.push(r.mem);
        } else {
            ux.push(x);
            uy.push(r.mem);
        }
    }
    [lx, ly, ux, uy]
}

// TWO-PHASE FIT AT ONE BREAKPOINT: INDEPENDENT SEGMENTS FIRST, KEPT IF THEY
// MEET BETWEEN LADDER[turn-1] AND LADDER[turn]; OTHERWISE PIN THE BREAKPOINT
// AT LADDER[turn-1].
fn fold_candidate(ladder: &[u32], records: &[ProbeRecord], turn: usize) -> Result<FoldFit, FitError> {
    let [lx, ly, ux, uy] = partition(ladder, records, turn);
    let lo = ladder[turn - 1] as f64;
    let hi = ladder[turn] as f64;

    if let (Ok(lower), Ok(upper)) = (regression::fit_line(&lx, &ly), regression::fit_line(&ux, &uy)) {
        if let Some(cross) = regression::intersect(&lower, &upper) {
            if cross >= lo && cross <= hi {
                let n1 = lx.len() as f64;
                let n2 = ux.len() as f64;
                let err = ((n1 * lower.err * lower.err + n2 * upper.err * upper.err) / (n1 + n2)).sqrt();
                return Ok(FoldFit {
                    slope1: lower.slope,
                    intercept1: lower.intercept,
                    slope2: upper.slope,
                    intercept2: upper.intercept,
                    cross,
                    err,
                });
            }
        }
    }
    regression::fit_fold_line(lo, &lx, &ly, &ux, &uy)
}

// BEST MODEL OVER ALL CANDIDATES. FAILS ONLY IF EVEN THE STRAIGHT LINE CAN'T BE FIT.
pub fn search(ladder: &[u32], records: &[ProbeRecord]) -> Result<PerfModel, FitError> {
    let x: Vec<f64> = records.iter().map(|r| ladder[r.ladder_idx] as f64).collect();
    let y: Vec<f64> = records.iter().map(|r| r.mem).collect();
    let line = regression::fit_line(&x, &y)?;
    debug!(target: "geepafs::model", slope = line.slope, intercept = line.intercept,
        err = line.err, "turn=none");
    let mut best = PerfModel::Linear(line);

    let k = ladder.len();
    for turn in 2..k.saturating_sub(1) {
        let fit = match fold_candidate(ladder, records, turn) {
            Ok(fit) => fit,
            Err(e) => {
                debug!(target: "geepafs::model", turn, "candidate dropped: {}", e);
                continue;
            }
        };
        debug!(target: "geepafs::model", turn, slope1 = fit.slope1, intercept1 = fit.intercept1,
            slope2 = fit.slope2, intercept2 = fit.intercept2, cross = fit.cross, err = fit.err,
            "fold candidate");
        if fit.slope1 <= fit.slope2 {
            debug!(target: "geepafs::model", turn, "slope1 <= slope2, candidate dropped");
            continue;
        }
        if fit.err < best.err() {
            best = PerfModel::FoldLine { fit, turn };
        }
    }
    Ok(best)
}

// PER-DEVICE MODEL CONSTRUCTION FOR ONE FINISHED PROBE CYCLE
pub struct ModelBuilder<'a> {
    profile: &'a DeviceProfile,
    assurance: f64,
    err_budget: f64,
    mem_low_threshold: f64,
    thorough: bool,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(profile: &'a DeviceProfile, assurance: f64, params: &ControlParams) -> Self {
        let num_rec = profile.probe_records(params.sweeps);
        Self {
            profile,
            assurance,
            err_budget: num_rec as f64 * params.err_tolerance,
            mem_low_threshold: params.mem_low_threshold,
            thorough: params.thorough,
        }
    }

    pub fn err_budget(&self) -> f64 {
        self.err_budget
    }

    pub fn build(&self, device: u32, buffer: &ProbeBuffer) -> ModelOutcome {
        let mem_mean = buffer.mem_mean();
        if buffer.is_empty() || mem_mean < self.mem_low_threshold {
            debug!(target: "geepafs::model", device, mem_mean, threshold = self.mem_low_threshold,
                "mem activity below threshold, clock set by utilization");
            return ModelOutcome::LowActivity { mem_mean };
        }

        let ladder = &self.profile.ladder;
        let model = match search(ladder, buffer.records()) {
            Ok(m) => m,
            Err(e) => {
                debug!(target: "geepafs::model", device, "no usable fit: {}", e);
                return ModelOutcome::Rejected { best_err: f64::INFINITY };
            }
        };
        if model.err() > self.err_budget {
            debug!(target: "geepafs::model", device, err = model.err(), budget = self.err_budget,
                "every fit exceeds the error budget, models discarded");
            return ModelOutcome::Rejected { best_err: model.err() };
        }

        let floor = ladder[0] as f64;
        let freq_bound = model.perf_bound(self.assurance, self.profile.max_mhz as f64, floor);
        let points = buffer.point_averages(ladder.len());
        let freq_eff = if self.thorough {
            self.efficient_over_candidates(device, &model, buffer.records())
                .or_else(|| self.efficient_at_probes(device, &model, &points))
        } else {
            self.efficient_at_probes(device, &model, &points)
        };

        match freq_eff {
            Some(freq_eff) if freq_bound.is_finite() => {
                debug!(target: "geepafs::model", device, model = model.kind(), err = model.err(),
                    freq_bound, freq_eff, "model accepted");
                ModelOutcome::Modeled { model, freq_bound, freq_eff }
            }
            _ => {
                debug!(target: "geepafs::model", device, freq_bound, "non-finite target, model discarded");
                ModelOutcome::Rejected { best_err: model.err() }
            }
        }
    }

    // CHEAP MODE: MODELED PERF / MEASURED AVERAGE POWER AT EACH PROBED CLOCK
    fn efficient_at_probes(&self, device: u32, model: &PerfModel, points: &[PointAverage]) -> Option<f64> {
        let ladder = &self.profile.ladder;
        let mut best: Option<(f64, u32)> = None;
        for (idx, p) in points.iter().enumerate() {
            if p.samples == 0 || p.power.is_nan() || p.power <= 0.0 {
                continue;
            }
            let eff = 100.0 * model.perf_at_probe(idx, ladder) / p.power;
            if !eff.is_finite() {
                continue;
            }
            match best {
                Some((b, _)) if b >= eff => {}
                _ => best = Some((eff, ladder[idx])),
            }
        }
        if let Some((eff, mhz)) = best {
            debug!(target: "geepafs::model", device, eff, mhz, "max efficiency at probed clock");
        }
        best.map(|(_, mhz)| mhz as f64)
    }

    // THOROUGH MODE: EXTRAPOLATE PERF, FIT A CUBIC POWER CURVE, SCAN EVERY
    // SETTABLE CLOCK FROM min_set_mhz UP
    fn efficient_over_candidates(&self, device: u32, model: &PerfModel, records: &[ProbeRecord]) -> Option<f64> {
        let ladder = &self.profile.ladder;
        let x: Vec<f64> = records.iter().map(|r| ladder[r.ladder_idx] as f64).collect();
        let y: Vec<f64> = records.iter().map(|r| r.power).collect();
        let power = match regression::fit_cubic(&x, &y) {
            Ok(c) => c,
            Err(e) => {
                debug!(target: "geepafs::model", device, "power model unavailable: {}", e);
                return None;
            }
        };

        let floor = ladder[0] as f64;
        let mut best: Option<(f64, u32)> = None;
        for &mhz in self.profile.candidates.iter().filter(|&&f| f >= self.profile.min_set_mhz) {
            let f = mhz as f64;
            let watts = power.eval(f);
            if watts.is_nan() || watts <= 0.0 {
                continue;
            }
            let eff = 100.0 * model.perf_at(f, floor) / watts;
            if !eff.is_finite() {
                continue;
            }
            match best {
                Some((b, _)) if b >= eff => {}
                _ => best = Some((eff, mhz)),
            }
        }
        if let Some((eff, mhz)) = best {
            debug!(target: "geepafs::model", device, eff, mhz, "max modeled efficiency");
        }
        best.map(|(_, mhz)| mhz as f64)
    }
}
