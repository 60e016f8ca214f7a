// GEEPAFS v1.2.0 -- PERFORMANCE-ASSURED GPU CLOCK CONTROL
// PROBES EACH GPU ACROSS A LADDER OF CORE CLOCKS, FITS A FOLD-LINE MODEL OF
// MEMORY THROUGHPUT AGAINST CLOCK, AND HOLDS THE CHEAPEST CLOCK THAT KEEPS THE
// REQUESTED FRACTION OF PEAK PERFORMANCE.
//
// STDOUT: ONE CSV ROW PER TICK. STDERR: DIAGNOSTICS.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use geepafs::adaptive::Controller;
use geepafs::cli::check;
use geepafs::config::FileConfig;
use geepafs::gpu::{ClockControl, NvidiaSmi, Telemetry};
use geepafs::policy::{build_policy, Policy};
use geepafs::sim::SimulatedGpu;
use geepafs::tuning::{ControlParams, DeviceProfile, BUILTIN_PROFILES, DEFAULT_ASSURANCE_PCT};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "geepafs")]
#[command(about = "GEEPAFS -- PERFORMANCE-ASSURED, ENERGY-EFFICIENT GPU CLOCK CONTROL")]
struct Cli {
    // FREQUENCY POLICY
    #[arg(long, value_enum, default_value_t = Policy::Assure)]
    policy: Policy,

    // PERCENT OF PEAK PERFORMANCE TO KEEP (ASSURE ONLY)
    #[arg(long, default_value_t = DEFAULT_ASSURANCE_PCT,
          value_parser = clap::value_parser!(u8).range(0..=100))]
    assurance: u8,

    // BUILT-IN DEVICE PROFILE (A [profile] TABLE IN --config WINS)
    #[arg(long, default_value = "v100-maxq")]
    profile: String,

    // TOML FILE WITH [control] AND/OR [profile] OVERRIDES
    #[arg(long)]
    config: Option<PathBuf>,

    // CONTROL ONLY THIS GPU (DEFAULT: ALL)
    #[arg(long)]
    device: Option<u32>,

    // RUN AGAINST N SIMULATED GPUS INSTEAD OF nvidia-smi
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,

    // STOP AFTER N TICKS (DEFAULT: RUN UNTIL CTRL+C)
    #[arg(long, value_name = "N")]
    ticks: Option<u64>,

    // SCAN EVERY SETTABLE CLOCK FOR THE EFFICIENT CLOCK (CUBIC POWER FIT)
    #[arg(long)]
    thorough: bool,

    // DON'T CAP THE CLOCK BY MEASURED COMPUTE ACTIVITY
    #[arg(long)]
    no_freq_cap: bool,

    // DEBUG-LEVEL DIAGNOSTICS ON STDERR
    #[arg(long)]
    verbose: bool,

    // DUMP FULL DECISION LOG ON EXIT
    #[arg(long)]
    dump_log: bool,

    // CHECK nvidia-smi, ROOT AND SUPPORTED CLOCKS, THEN EXIT
    #[arg(long)]
    check: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve(cli: &Cli) -> Result<(DeviceProfile, ControlParams)> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let profile = match file.profile {
        Some(p) => p,
        None => DeviceProfile::builtin(&cli.profile)
            .with_context(|| format!("built-in profiles: {}", BUILTIN_PROFILES.join(", ")))?,
    };
    let mut params = file.control;
    if cli.thorough {
        params.thorough = true;
    }
    if cli.no_freq_cap {
        params.freq_cap = false;
    }
    Ok((profile, params.sanitized()))
}

fn controlled_devices(count: usize, only: Option<u32>) -> Result<Vec<u32>> {
    if count == 0 {
        bail!("no GPUs found");
    }
    match only {
        Some(id) if id as usize >= count => bail!("--device {} out of range ({} GPUs)", id, count),
        Some(id) => Ok(vec![id]),
        None => Ok((0..count as u32).collect()),
    }
}

fn run<B: Telemetry + ClockControl>(
    mut backend: B,
    cli: &Cli,
    profile: DeviceProfile,
    params: ControlParams,
) -> Result<()> {
    let count = backend.device_count().context("cannot enumerate GPUs")?;
    let ids = controlled_devices(count, cli.device)?;
    let assurance = cli.assurance as f64 / 100.0;
    let policy = build_policy(cli.policy, &profile, assurance, &params);

    eprintln!("GEEPAFS v1.2.0");
    eprintln!("BACKEND:         {}", if cli.simulate.is_some() { "simulated" } else { "nvidia-smi" });
    eprintln!("GPUS:            {} (controlling {:?})", count, ids);
    eprintln!("PROFILE:         {} (min={}, eff={}, max={} MHz)",
              profile.name, profile.min_set_mhz, profile.avg_eff_mhz, profile.max_mhz);
    eprintln!("POLICY:          {}", cli.policy.name());
    if cli.policy == Policy::Assure {
        eprintln!("ASSURANCE:       {}%", cli.assurance);
        eprintln!("EFFICIENCY:      {}", if params.thorough { "thorough" } else { "probe points" });
        eprintln!("FREQ CAP:        {}", params.freq_cap);
    }
    eprintln!("TICK:            {} ms (probe interval {} ms)",
              params.tick_period_ms, params.probe_interval_ms);
    eprintln!();

    // UNCONTROLLED GPUS STILL COUNT TOWARD FLEET MEM ACTIVITY
    let observed: Vec<u32> = (0..count as u32).filter(|id| !ids.contains(id)).collect();
    let mut ctl = Controller::new(backend, policy, profile, params, &ids).observe(&observed);

    eprintln!("GEEPAFS IS ACTIVE (CTRL+C TO EXIT)");
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let result = ctl.run(&SHUTDOWN, &mut out, cli.ticks);
    out.flush().ok();
    eprintln!("GEEPAFS IS SHUTTING DOWN");

    if cli.dump_log {
        ctl.log.dump();
    }
    ctl.log.summary();
    result
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let (profile, params) = resolve(&cli)?;

    if cli.check {
        if !check::run_check(&profile)? {
            std::process::exit(1);
        }
        return Ok(());
    }

    let result = match cli.simulate {
        Some(n) => run(SimulatedGpu::fleet(&profile, n), &cli, profile, params),
        None => {
            let refresh = Duration::from_millis(params.telemetry_refresh_ms);
            run(NvidiaSmi::new(refresh), &cli, profile, params)
        }
    };
    if result.is_ok() {
        info!("clocks restored");
    }

    eprintln!("GEEPAFS OUT.");
    result
}
