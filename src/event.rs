// GEEPAFS DECISION LOG
// RECORDS EVERY FREQUENCY DECISION THE MODEL BUILDER PRODUCES
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION WHILE THE LOOP RUNS.
// WRAPS AROUND AT CAPACITY: OLDEST ENTRIES OVERWRITTEN.

use crate::select::FrequencyDecision;

pub const MAX_DECISIONS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecisionRecord {
    pub ts_ns:      u64,
    pub device:     u32,
    pub outcome:    &'static str,   // linear / fold-line / low-activity / rejected
    pub freq_bound: f64,
    pub freq_eff:   f64,
    pub freq_cap:   Option<f64>,
    pub freq_opt:   f64,
    pub target_mhz: u32,
}

const EMPTY: DecisionRecord = DecisionRecord {
    ts_ns: 0,
    device: 0,
    outcome: "",
    freq_bound: 0.0,
    freq_eff: 0.0,
    freq_cap: None,
    freq_opt: 0.0,
    target_mhz: 0,
};

pub struct DecisionLog {
    records:  Vec<DecisionRecord>,
    capacity: usize,
    head:     usize,
    len:      usize,
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_DECISIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: vec![EMPTY; capacity],
            capacity,
            head: 0,
            len: 0,
        }
    }

    // RECORD ONE DECISION. CALLED ONCE PER DEVICE PER PROBE CYCLE.
    // OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn record(&mut self, device: u32, outcome: &'static str, d: &FrequencyDecision) {
        self.records[self.head] = DecisionRecord {
            ts_ns: now_ns(),
            device,
            outcome,
            freq_bound: d.freq_bound,
            freq_eff: d.freq_eff,
            freq_cap: d.freq_cap,
            freq_opt: d.freq_opt,
            target_mhz: d.target_mhz,
        };
        self.head = (self.head + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // ITERATE RECORDS IN CHRONOLOGICAL ORDER
    pub fn iter(&self) -> impl Iterator<Item = &DecisionRecord> {
        let start = if self.len < self.capacity { 0 } else { self.head };
        (0..self.len).map(move |i| &self.records[(start + i) % self.capacity])
    }

    // DUMP THE DECISION HISTORY AFTER EXECUTION (STDERR: STDOUT CARRIES THE CSV)
    pub fn dump(&self) {
        let mut iter = self.iter();
        let first = match iter.next() {
            Some(r) => r,
            None => return,
        };
        let base_ts = first.ts_ns;

        eprintln!("\n{:<10} {:<4} {:<13} {:<9} {:<9} {:<9} {:<9} {:<7}",
            "TIME_S", "GPU", "MODEL", "BOUND", "EFF", "CAP", "OPT", "SET");
        eprintln!("{}", "-".repeat(76));

        for r in std::iter::once(first).chain(iter) {
            let elapsed_s = r.ts_ns.saturating_sub(base_ts) as f64 / 1_000_000_000.0;
            let cap = match r.freq_cap {
                Some(c) => format!("{:.1}", c),
                None => "-".to_string(),
            };
            eprintln!("{:<10.1} {:<4} {:<13} {:<9.1} {:<9.1} {:<9} {:<9.1} {:<7}",
                elapsed_s, r.device, r.outcome, r.freq_bound, r.freq_eff,
                cap, r.freq_opt, r.target_mhz);
        }

        if self.len == self.capacity {
            eprintln!("\n(RING BUFFER WRAPPED: SHOWING MOST RECENT {} DECISIONS)", self.capacity);
        }
        eprintln!("TOTAL DECISIONS: {}", self.len);
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        if self.len == 0 {
            return;
        }

        let count = |label: &str| self.iter().filter(|r| r.outcome == label).count();
        let fold = count("fold-line");
        let linear = count("linear");
        let low = count("low-activity");
        let rejected = count("rejected");
        let mean_mhz = self.iter().map(|r| r.target_mhz as f64).sum::<f64>() / self.len as f64;
        let lowest = self.iter().map(|r| r.target_mhz).min().unwrap_or(0);
        let highest = self.iter().map(|r| r.target_mhz).max().unwrap_or(0);

        eprintln!("\n{}", "=".repeat(50));
        eprintln!("GEEPAFS SUMMARY");
        eprintln!("{}", "=".repeat(50));
        eprintln!("  DECISIONS:         {}", self.len);
        eprintln!("  MODELS:            FOLD-LINE {} / LINEAR {}", fold, linear);
        eprintln!("  FALLBACKS:         LOW-ACTIVITY {} / REJECTED {}", low, rejected);
        eprintln!("  TARGET MHz:        MEAN {:.0} (MIN {}, MAX {})", mean_mhz, lowest, highest);
    }
}

// CLOCK_MONOTONIC IN NANOSECONDS
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}
