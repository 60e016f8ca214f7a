// GEEPAFS GPU BACKENDS
// TELEMETRY IN, CLOCK COMMANDS OUT. THE CONTROL LOOP ONLY SEES THESE TWO TRAITS.
//
// HARDWARE BACKEND DRIVES nvidia-smi:
//   QUERY:  --query-gpu=index,utilization.gpu,utilization.memory,power.draw,clocks.sm
//   SET:    -i N -ac MEM,CORE     (APPLICATION CLOCKS)
//   RESET:  -i N -rgc, -i N -rac  (LOCKED CLOCKS, THEN APPLICATION CLOCKS)
// ONE QUERY COVERS EVERY DEVICE AND IS CACHED FOR THE REFRESH INTERVAL.

use std::process::{Command, Output};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub compute: f64,   // [0, 1]
    pub mem: f64,       // [0, 1]
    pub power_w: f64,
    pub clock_mhz: u32,
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("device {device}: telemetry unavailable: {reason}")]
    TelemetryUnavailable { device: u32, reason: String },
    #[error("device {device}: clock command failed: {reason}")]
    CommandFailed { device: u32, reason: String },
    #[error("nvidia-smi query failed: {0}")]
    QueryFailed(String),
    #[error("cannot run nvidia-smi: {0}")]
    Spawn(#[from] std::io::Error),
}

pub trait Telemetry {
    fn device_count(&mut self) -> Result<usize, GpuError>;
    fn sample(&mut self, device: u32) -> Result<MetricSample, GpuError>;
}

pub trait ClockControl {
    fn command_frequency(&mut self, device: u32, mem_mhz: u32, core_mhz: u32) -> Result<(), GpuError>;
    fn reset_frequency(&mut self, device: u32) -> Result<(), GpuError>;
}

const QUERY_FIELDS: &str = "index,utilization.gpu,utilization.memory,power.draw,clocks.sm";

pub type Row = (u32, Result<MetricSample, String>);

fn field<'a>(fields: &[&'a str], i: usize, name: &str) -> Result<&'a str, String> {
    match fields.get(i).map(|f| f.trim()) {
        Some(f) if f.starts_with('[') => Err(format!("{} {}", name, f)),
        Some(f) => Ok(f),
        None => Err(format!("missing {}", name)),
    }
}

fn parse_f64(fields: &[&str], i: usize, name: &str) -> Result<f64, String> {
    let raw = field(fields, i, name)?;
    raw.parse::<f64>().map_err(|_| format!("bad {} '{}'", name, raw))
}

fn parse_sample(fields: &[&str]) -> Result<MetricSample, String> {
    let compute = parse_f64(fields, 1, "utilization.gpu")? / 100.0;
    let mem = parse_f64(fields, 2, "utilization.memory")? / 100.0;
    let power_w = parse_f64(fields, 3, "power.draw")?;
    let clock = parse_f64(fields, 4, "clocks.sm")?;
    Ok(MetricSample {
        compute: compute.clamp(0.0, 1.0),
        mem: mem.clamp(0.0, 1.0),
        power_w,
        clock_mhz: clock.max(0.0).round() as u32,
    })
}

// ONE CSV ROW: "0, 45, 12, 87.50, 1380". PERCENTAGES BECOME FRACTIONS.
// UNSUPPORTED FIELDS ("[N/A]", "[Not Supported]") FAIL THAT DEVICE ONLY.
fn parse_row(line: &str) -> Option<Row> {
    let fields: Vec<&str> = line.split(',').collect();
    let index = fields.first()?.trim().parse::<u32>().ok()?;
    Some((index, parse_sample(&fields)))
}

pub fn parse_query(text: &str) -> Vec<Row> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_row)
        .collect()
}

fn stderr_of(out: &Output) -> String {
    let err = String::from_utf8_lossy(&out.stderr).trim().to_string();
    if err.is_empty() {
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    } else {
        err
    }
}

pub struct NvidiaSmi {
    refresh: Duration,
    cache: Option<(Instant, Vec<Row>)>,
}

impl NvidiaSmi {
    pub fn new(refresh: Duration) -> Self {
        Self { refresh, cache: None }
    }

    fn run(&self, args: &[&str]) -> Result<Output, GpuError> {
        Ok(Command::new("nvidia-smi").args(args).output()?)
    }

    fn rows(&mut self) -> Result<&[Row], GpuError> {
        let stale = match &self.cache {
            Some((at, _)) => at.elapsed() >= self.refresh,
            None => true,
        };
        if stale {
            let query = format!("--query-gpu={}", QUERY_FIELDS);
            let out = self.run(&[query.as_str(), "--format=csv,noheader,nounits"])?;
            if !out.status.success() {
                return Err(GpuError::QueryFailed(stderr_of(&out)));
            }
            let rows = parse_query(&String::from_utf8_lossy(&out.stdout));
            self.cache = Some((Instant::now(), rows));
        }
        Ok(self.cache.as_ref().map(|(_, rows)| rows.as_slice()).unwrap_or(&[]))
    }

    // EVERY SETTABLE CORE CLOCK FOR ONE DEVICE, ASCENDING. USED BY --check.
    pub fn supported_clocks(&self, device: u32) -> Result<Vec<u32>, GpuError> {
        let idx = device.to_string();
        let out = self.run(&[
            "-i",
            idx.as_str(),
            "--query-supported-clocks=graphics",
            "--format=csv,noheader,nounits",
        ])?;
        if !out.status.success() {
            return Err(GpuError::TelemetryUnavailable { device, reason: stderr_of(&out) });
        }
        let mut clocks: Vec<u32> = String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect();
        clocks.sort_unstable();
        clocks.dedup();
        Ok(clocks)
    }

    fn command(&self, device: u32, args: &[&str]) -> Result<(), GpuError> {
        let idx = device.to_string();
        let mut full = vec!["-i", idx.as_str()];
        full.extend_from_slice(args);
        let out = self.run(&full)?;
        if out.status.success() {
            Ok(())
        } else {
            Err(GpuError::CommandFailed { device, reason: stderr_of(&out) })
        }
    }
}

impl Telemetry for NvidiaSmi {
    fn device_count(&mut self) -> Result<usize, GpuError> {
        Ok(self.rows()?.len())
    }

    fn sample(&mut self, device: u32) -> Result<MetricSample, GpuError> {
        let rows = self.rows()?;
        match rows.iter().find(|(idx, _)| *idx == device) {
            Some((_, Ok(sample))) => Ok(*sample),
            Some((_, Err(reason))) => Err(GpuError::TelemetryUnavailable { device, reason: reason.clone() }),
            None => Err(GpuError::TelemetryUnavailable { device, reason: "not reported".to_string() }),
        }
    }
}

impl ClockControl for NvidiaSmi {
    fn command_frequency(&mut self, device: u32, mem_mhz: u32, core_mhz: u32) -> Result<(), GpuError> {
        let clocks = format!("{},{}", mem_mhz, core_mhz);
        debug!(target: "geepafs::hw", device, mem_mhz, core_mhz, "set application clocks");
        self.command(device, &["-ac", clocks.as_str()])
    }

    // BOTH RESETS ARE ATTEMPTED. THE FIRST FAILURE IS REPORTED.
    fn reset_frequency(&mut self, device: u32) -> Result<(), GpuError> {
        debug!(target: "geepafs::hw", device, "reset clocks");
        let locked = self.command(device, &["-rgc"]);
        let app = self.command(device, &["-rac"]);
        locked.and(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_two_devices() {
        let rows = parse_query("0, 45, 12, 87.50, 1380\n1, 100, 3, 250.12, 1530\n");
        assert_eq!(rows.len(), 2);
        let (idx, s) = &rows[0];
        assert_eq!(*idx, 0);
        let s = s.as_ref().unwrap();
        assert!((s.compute - 0.45).abs() < 1e-12);
        assert!((s.mem - 0.12).abs() < 1e-12);
        assert!((s.power_w - 87.5).abs() < 1e-12);
        assert_eq!(s.clock_mhz, 1380);
        assert_eq!(rows[1].0, 1);
        assert!((rows[1].1.as_ref().unwrap().compute - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unsupported_field_fails_one_device() {
        let rows = parse_query("0, 45, 12, [N/A], 1380\n1, 10, 3, 60.0, 900\n");
        assert_eq!(rows.len(), 2);
        let err = rows[0].1.as_ref().unwrap_err();
        assert!(err.contains("power.draw"), "{}", err);
        assert!(rows[1].1.is_ok());
    }

    #[test]
    fn garbage_lines_skipped() {
        let rows = parse_query("\nNVIDIA-SMI has failed\n0, 1, 2, 3, 4\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 0);
    }

    #[test]
    fn short_row_reports_missing_field() {
        let rows = parse_query("3, 45, 12\n");
        assert_eq!(rows[0].0, 3);
        assert!(rows[0].1.as_ref().unwrap_err().contains("missing"));
    }
}
