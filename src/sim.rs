// GEEPAFS SIMULATED GPU
// DETERMINISTIC STAND-IN FOR nvidia-smi. DRIVES --simulate DRY RUNS AND THE
// OFFLINE TESTS. NO HARDWARE, NO ROOT.
//
// EACH DEVICE RUNS A FIXED WORKLOAD:
//   MEM ACTIVITY  FOLD-LINE IN THE CORE CLOCK (STEEP, THEN SATURATING)
//   COMPUTE       CONSTANT FRACTION
//   POWER         STATIC + DYNAMIC * (f / 1000)^3
// A COMMAND TAKES EFFECT IMMEDIATELY. THE LOOP READS BEFORE IT COMMANDS, SO
// THE NEW CLOCK SHOWS UP IN THE NEXT TICK'S SAMPLE.

use crate::gpu::{ClockControl, GpuError, MetricSample, Telemetry};
use crate::tuning::DeviceProfile;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Workload {
    pub breakpoint_mhz: f64,
    pub slope1: f64,
    pub intercept1: f64,
    pub slope2: f64,
    pub intercept2: f64,
    pub compute: f64,
    pub static_w: f64,
    pub dynamic_w: f64,
}

impl Workload {
    // MEMORY-BOUND KERNEL: BANDWIDTH STOPS SCALING PAST 900 MHz
    pub fn memory_bound() -> Self {
        Self {
            breakpoint_mhz: 900.0,
            slope1: 0.001,
            intercept1: 0.0,
            slope2: 0.0001,
            intercept2: 0.81,
            compute: 0.95,
            static_w: 150.0,
            dynamic_w: 60.0,
        }
    }

    // COMPUTE-BOUND KERNEL: LITTLE DRAM TRAFFIC, SCALES WITH THE CLOCK
    pub fn compute_bound() -> Self {
        Self {
            breakpoint_mhz: 2000.0,
            slope1: 0.0002,
            intercept1: 0.0,
            slope2: 0.0002,
            intercept2: 0.0,
            compute: 1.0,
            static_w: 60.0,
            dynamic_w: 80.0,
        }
    }

    // NOTHING RUNNING
    pub fn idle() -> Self {
        Self {
            breakpoint_mhz: 0.0,
            slope1: 0.0,
            intercept1: 0.0,
            slope2: 0.0,
            intercept2: 0.0,
            compute: 0.0,
            static_w: 40.0,
            dynamic_w: 5.0,
        }
    }

    pub fn mem_at(&self, mhz: f64) -> f64 {
        let mem = if mhz < self.breakpoint_mhz {
            self.slope1 * mhz + self.intercept1
        } else {
            self.slope2 * mhz + self.intercept2
        };
        mem.clamp(0.0, 1.0)
    }

    pub fn power_at(&self, mhz: f64) -> f64 {
        let u = mhz / 1000.0;
        self.static_w + self.dynamic_w * u * u * u
    }
}

#[derive(Debug, Clone)]
struct SimDevice {
    workload: Workload,
    clock_mhz: u32,
    failing_reads: u32,
    failing_commands: u32,
}

#[derive(Debug, Clone)]
pub struct SimulatedGpu {
    devices: Vec<SimDevice>,
    boost_mhz: u32,
    supported: Vec<u32>,
    commands: Vec<(u32, u32)>,
    resets: Vec<u32>,
}

impl SimulatedGpu {
    // UNCONTROLLED DEVICES SIT AT THE PROFILE'S MAX CLOCK
    pub fn new(profile: &DeviceProfile, workloads: Vec<Workload>) -> Self {
        let boost_mhz = profile.max_mhz;
        let devices = workloads
            .into_iter()
            .map(|workload| SimDevice { workload, clock_mhz: boost_mhz, failing_reads: 0, failing_commands: 0 })
            .collect();
        Self {
            devices,
            boost_mhz,
            supported: profile.candidates.clone(),
            commands: Vec::new(),
            resets: Vec::new(),
        }
    }

    // MIXED FLEET FOR DRY RUNS: MEMORY-BOUND, COMPUTE-BOUND, IDLE, REPEATING
    pub fn fleet(profile: &DeviceProfile, count: usize) -> Self {
        let kinds = [Workload::memory_bound(), Workload::compute_bound(), Workload::idle()];
        let workloads = (0..count).map(|i| kinds[i % kinds.len()]).collect();
        Self::new(profile, workloads)
    }

    // NEXT n READS OF device FAIL
    pub fn fail_reads(&mut self, device: u32, n: u32) {
        if let Some(d) = self.devices.get_mut(device as usize) {
            d.failing_reads = n;
        }
    }

    // NEXT n CLOCK COMMANDS TO device FAIL AND LEAVE THE CLOCK AS IT WAS
    pub fn fail_commands(&mut self, device: u32, n: u32) {
        if let Some(d) = self.devices.get_mut(device as usize) {
            d.failing_commands = n;
        }
    }

    pub fn clock(&self, device: u32) -> Option<u32> {
        self.devices.get(device as usize).map(|d| d.clock_mhz)
    }

    // EVERY (device, core MHz) COMMAND, IN ORDER
    pub fn commands(&self) -> &[(u32, u32)] {
        &self.commands
    }

    pub fn resets(&self) -> &[u32] {
        &self.resets
    }

    fn device_mut(&mut self, device: u32) -> Result<&mut SimDevice, GpuError> {
        self.devices
            .get_mut(device as usize)
            .ok_or_else(|| GpuError::CommandFailed { device, reason: "no such device".to_string() })
    }
}

impl Telemetry for SimulatedGpu {
    fn device_count(&mut self) -> Result<usize, GpuError> {
        Ok(self.devices.len())
    }

    fn sample(&mut self, device: u32) -> Result<MetricSample, GpuError> {
        let d = self.devices.get_mut(device as usize).ok_or_else(|| GpuError::TelemetryUnavailable {
            device,
            reason: "no such device".to_string(),
        })?;
        if d.failing_reads > 0 {
            d.failing_reads -= 1;
            return Err(GpuError::TelemetryUnavailable { device, reason: "simulated read failure".to_string() });
        }
        let f = d.clock_mhz as f64;
        Ok(MetricSample {
            compute: d.workload.compute,
            mem: d.workload.mem_at(f),
            power_w: d.workload.power_at(f),
            clock_mhz: d.clock_mhz,
        })
    }
}

impl ClockControl for SimulatedGpu {
    fn command_frequency(&mut self, device: u32, _mem_mhz: u32, core_mhz: u32) -> Result<(), GpuError> {
        if !self.supported.contains(&core_mhz) {
            return Err(GpuError::CommandFailed { device, reason: format!("unsupported clock {}", core_mhz) });
        }
        let d = self.device_mut(device)?;
        if d.failing_commands > 0 {
            d.failing_commands -= 1;
            return Err(GpuError::CommandFailed { device, reason: "simulated command failure".to_string() });
        }
        d.clock_mhz = core_mhz;
        self.commands.push((device, core_mhz));
        Ok(())
    }

    fn reset_frequency(&mut self, device: u32) -> Result<(), GpuError> {
        let boost = self.boost_mhz;
        self.device_mut(device)?.clock_mhz = boost;
        self.resets.push(device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maxq() -> DeviceProfile {
        DeviceProfile::builtin("v100-maxq").unwrap()
    }

    #[test]
    fn memory_bound_response_folds_at_900() {
        let w = Workload::memory_bound();
        assert!((w.mem_at(720.0) - 0.72).abs() < 1e-12);
        assert!((w.mem_at(1440.0) - 0.954).abs() < 1e-12);
        assert!((w.mem_at(899.0) - 0.899).abs() < 1e-12);
        assert!((w.mem_at(900.0) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn command_changes_next_sample() {
        let mut gpu = SimulatedGpu::new(&maxq(), vec![Workload::memory_bound()]);
        assert_eq!(gpu.sample(0).unwrap().clock_mhz, 1440);
        gpu.command_frequency(0, 810, 720).unwrap();
        let s = gpu.sample(0).unwrap();
        assert_eq!(s.clock_mhz, 720);
        assert!((s.mem - 0.72).abs() < 1e-12);
        assert_eq!(gpu.commands(), &[(0, 720)]);
    }

    #[test]
    fn unsupported_clock_rejected() {
        let mut gpu = SimulatedGpu::new(&maxq(), vec![Workload::idle()]);
        let err = gpu.command_frequency(0, 810, 721).unwrap_err();
        assert!(matches!(err, GpuError::CommandFailed { device: 0, .. }));
        assert_eq!(gpu.clock(0), Some(1440));
    }

    #[test]
    fn reset_restores_boost() {
        let mut gpu = SimulatedGpu::new(&maxq(), vec![Workload::idle()]);
        gpu.command_frequency(0, 810, 720).unwrap();
        gpu.reset_frequency(0).unwrap();
        assert_eq!(gpu.clock(0), Some(1440));
        assert_eq!(gpu.resets(), &[0]);
    }

    #[test]
    fn injected_command_failures() {
        let mut gpu = SimulatedGpu::new(&maxq(), vec![Workload::idle()]);
        gpu.fail_commands(0, 1);
        assert!(gpu.command_frequency(0, 810, 720).is_err());
        assert_eq!(gpu.clock(0), Some(1440));
        gpu.command_frequency(0, 810, 720).unwrap();
        assert_eq!(gpu.clock(0), Some(720));
        assert_eq!(gpu.commands(), &[(0, 720)]);
    }

    #[test]
    fn injected_read_failures() {
        let mut gpu = SimulatedGpu::fleet(&maxq(), 2);
        gpu.fail_reads(1, 2);
        assert!(gpu.sample(1).is_err());
        assert!(gpu.sample(0).is_ok());
        assert!(gpu.sample(1).is_err());
        assert!(gpu.sample(1).is_ok());
        assert!(matches!(gpu.sample(5), Err(GpuError::TelemetryUnavailable { device: 5, .. })));
    }
}
