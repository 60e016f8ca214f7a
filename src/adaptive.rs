// GEEPAFS CONTROL LOOP
// SINGLE-THREADED, ONE TICK AT A TIME:
//
//   READ TELEMETRY -> POLICY DECIDES PER DEVICE -> COMMAND CLOCK (IF ASKED)
//   -> PRINT ONE CSV ROW -> PAD TO THE TICK PERIOD -> ADVANCE PROBE SCHEDULERS
//
// A FAILED READ OR COMMAND IS LOGGED AND THE TICK MOVES ON; THAT DEVICE'S
// PROBE SCHEDULER HOLDS ITS PHASE AND RETRIES THE STEP. ONLY THE SHUTDOWN
// FLAG (OR A DEAD STDOUT) ENDS THE LOOP. EVERY CONTROLLED DEVICE IS RESET
// BEFORE THE FIRST TICK AND ON EVERY EXIT PATH.
//
// OBSERVED DEVICES (NOT UNDER CONTROL) ARE ONLY READ: THEIR MEM ACTIVITY
// COUNTS TOWARD THE FLEET-WIDE PROBE TRIGGER.

use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::event::DecisionLog;
use crate::gpu::{ClockControl, Telemetry};
use crate::policy::{DeviceState, FrequencyPolicy, TickContext};
use crate::smoothing::MovingAverage;
use crate::tuning::{ControlParams, DeviceProfile};

// SHUTDOWN IS CHECKED AT LEAST THIS OFTEN WHILE PADDING A TICK
const SLEEP_SLICE: Duration = Duration::from_millis(20);

pub struct Controller<B: Telemetry + ClockControl> {
    backend: B,
    policy: Box<dyn FrequencyPolicy>,
    profile: DeviceProfile,
    params: ControlParams,
    devices: Vec<DeviceState>,
    observed: Vec<(u32, MovingAverage)>,
    tick: u64,
    pub log: DecisionLog,
}

// RESETS EVERY CONTROLLED DEVICE WHEN DROPPED: NORMAL EXIT, ERROR OR PANIC
struct ResetGuard<'a, B: Telemetry + ClockControl>(&'a mut Controller<B>);

impl<B: Telemetry + ClockControl> Drop for ResetGuard<'_, B> {
    fn drop(&mut self) {
        info!(target: "geepafs::loop", "resetting gpu clocks");
        self.0.reset_all();
    }
}

impl<B: Telemetry + ClockControl> Deref for ResetGuard<'_, B> {
    type Target = Controller<B>;

    fn deref(&self) -> &Controller<B> {
        &*self.0
    }
}

impl<B: Telemetry + ClockControl> DerefMut for ResetGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Controller<B> {
        &mut *self.0
    }
}

impl<B: Telemetry + ClockControl> Controller<B> {
    pub fn new(
        backend: B,
        policy: Box<dyn FrequencyPolicy>,
        profile: DeviceProfile,
        params: ControlParams,
        device_ids: &[u32],
    ) -> Self {
        let devices = device_ids
            .iter()
            .map(|&id| DeviceState::new(id, &profile, &params))
            .collect();
        Self {
            backend,
            policy,
            profile,
            params,
            devices,
            observed: Vec::new(),
            tick: 0,
            log: DecisionLog::new(),
        }
    }

    // READ-ONLY DEVICES: SAMPLED EVERY TICK, NEVER PRINTED, COMMANDED OR RESET
    pub fn observe(mut self, ids: &[u32]) -> Self {
        let window = self.params.window;
        self.observed.extend(ids.iter().map(|&id| (id, MovingAverage::new(window))));
        self
    }

    pub fn devices(&self) -> &[DeviceState] {
        &self.devices
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.params.tick_period_ms)
    }

    pub fn header(&self) -> String {
        let mut line = String::from("time");
        for dev in &self.devices {
            let id = dev.id;
            line.push_str(&format!(
                ",gpu{id}_util,gpu{id}_mem,gpu{id}_power,gpu{id}_clock,gpu{id}_setFreq"
            ));
        }
        line.push_str(",latency_us");
        line
    }

    // RETURNS THE NUMBER OF DEVICES THAT FAILED TO RESET
    pub fn reset_all(&mut self) -> usize {
        let mut failed = 0;
        for dev in &self.devices {
            if let Err(e) = self.backend.reset_frequency(dev.id) {
                warn!(target: "geepafs::hw", "{}", e);
                failed += 1;
            }
        }
        failed
    }

    // ONE TICK BODY, WITHOUT THE PADDING SLEEP OR THE SCHEDULER ADVANCE.
    // RETURNS THE OUTPUT ROW.
    pub fn step(&mut self) -> String {
        let started = Instant::now();
        let stamp = wall_clock_stamp();
        let ctx = TickContext { tick: self.tick, initial: self.tick == 0 };

        for dev in self.devices.iter_mut() {
            dev.set_mhz = None;
            dev.tick_ok = false;
            let sample = match self.backend.sample(dev.id) {
                Ok(s) => s,
                Err(e) => {
                    warn!(target: "geepafs::loop", tick = self.tick, "{}", e);
                    dev.last_sample = None;
                    continue;
                }
            };
            dev.last_sample = Some(sample);

            let cmd = self.policy.decide(&ctx, dev, &sample);
            dev.set_mhz = cmd.mhz;
            dev.tick_ok = true;
            if let (true, Some(mhz)) = (cmd.apply, cmd.mhz) {
                if let Err(e) = self.backend.command_frequency(dev.id, self.profile.mem_mhz, mhz) {
                    warn!(target: "geepafs::hw", tick = self.tick, "{}", e);
                    dev.tick_ok = false;
                }
            }
            if let Some((outcome, decision)) = dev.take_fresh() {
                self.log.record(dev.id, outcome, &decision);
            }
        }

        for (id, mem_avg) in self.observed.iter_mut() {
            match self.backend.sample(*id) {
                Ok(s) => mem_avg.push(s.mem),
                Err(e) => debug!(target: "geepafs::loop", tick = self.tick, "observed {}", e),
            }
        }

        format_row(&stamp, &self.devices, started.elapsed())
    }

    // END OF TICK: elapsed IS THE WALL TIME THE TICK TOOK, PADDING INCLUDED
    pub fn advance(&mut self, elapsed: Duration) {
        let background_mem: f64 = self.observed.iter().map(|(_, m)| m.mean()).sum();
        self.policy.end_tick(&mut self.devices, background_mem, elapsed);
        self.tick += 1;
    }

    // MAIN LOOP. max_ticks BOUNDS DRY RUNS. THE HEADER IS WRITTEN ONCE.
    pub fn run<W: Write>(&mut self, shutdown: &AtomicBool, out: &mut W, max_ticks: Option<u64>) -> Result<()> {
        info!(target: "geepafs::loop", policy = self.policy.policy().name(), profile = %self.profile.name,
            devices = self.devices.len(), "control loop starting");
        let mut ctl = ResetGuard(self);
        ctl.reset_all();
        let period = ctl.tick_period();

        writeln!(out, "{}", ctl.header())?;
        while !shutdown.load(Ordering::Relaxed) {
            if max_ticks.is_some_and(|m| ctl.tick >= m) {
                break;
            }
            let started = Instant::now();
            let row = ctl.step();
            writeln!(out, "{}", row)?;
            out.flush()?;

            let busy = started.elapsed();
            let elapsed = if busy < period {
                sleep_interruptible(period - busy, shutdown);
                period
            } else {
                busy
            };
            ctl.advance(elapsed);
        }
        info!(target: "geepafs::loop", ticks = ctl.tick, "control loop stopped");
        Ok(())
    }
}

fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

// time, THEN util,mem,power,clock,setFreq PER DEVICE, THEN latency_us.
// A DEVICE WITHOUT TELEMETRY THIS TICK PRINTS EMPTY FIELDS.
pub fn format_row(stamp: &str, devices: &[DeviceState], latency: Duration) -> String {
    let mut line = String::from(stamp);
    for dev in devices {
        let set = dev.set_mhz.map_or(-1, |m| m as i64);
        match dev.last_sample {
            Some(s) => line.push_str(&format!(
                ",{:.3},{:.3},{:.2},{},{}",
                s.compute, s.mem, s.power_w, s.clock_mhz, set
            )),
            None => line.push_str(&format!(",,,,,{}", set)),
        }
    }
    line.push_str(&format!(",{}", latency.as_micros()));
    line
}

// LOCAL WALL CLOCK, MILLISECOND RESOLUTION: 2026-03-01 14:07:09.125
pub fn wall_clock_stamp() -> String {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        libc::localtime_r(&ts.tv_sec, &mut tm);
    }
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        ts.tv_nsec / 1_000_000
    )
}
