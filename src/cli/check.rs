use std::process::Command;

use anyhow::Result;

use crate::gpu::{NvidiaSmi, Telemetry};
use crate::tuning::{DeviceProfile, TELEMETRY_REFRESH_MS};

fn check_tool(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

// PROFILE CLOCKS THE DRIVER WON'T ACCEPT
pub fn unsupported_clocks(profile: &DeviceProfile, supported: &[u32]) -> Vec<u32> {
    let mut wanted: Vec<u32> = profile.ladder.clone();
    wanted.push(profile.min_set_mhz);
    wanted.push(profile.avg_eff_mhz);
    wanted.push(profile.max_mhz);
    wanted.sort_unstable();
    wanted.dedup();
    wanted.into_iter().filter(|f| !supported.contains(f)).collect()
}

// RETURNS Ok(true) WHEN EVERY CHECK PASSED
pub fn run_check(profile: &DeviceProfile) -> Result<bool> {
    println!("GEEPAFS DEPENDENCY CHECK");
    println!();

    let mut ok = true;
    if check_tool("nvidia-smi") {
        println!("  {:<24}OK", "nvidia-smi");
    } else {
        println!("  {:<24}MISSING", "nvidia-smi");
        ok = false;
    }
    if is_root() {
        println!("  {:<24}OK", "root");
    } else {
        println!("  {:<24}NO (clock control needs root)", "root");
        ok = false;
    }
    println!();

    if !ok {
        println!("SOME CHECKS FAILED");
        return Ok(false);
    }

    let mut smi = NvidiaSmi::new(std::time::Duration::from_millis(TELEMETRY_REFRESH_MS));
    let count = match smi.device_count() {
        Ok(n) => n,
        Err(e) => {
            println!("  DEVICE QUERY          FAILED ({})", e);
            println!("SOME CHECKS FAILED");
            return Ok(false);
        }
    };
    println!("  DEVICES               {}", count);
    println!("  PROFILE               {}", profile.name);

    for dev in 0..count as u32 {
        match smi.supported_clocks(dev) {
            Ok(clocks) => {
                let missing = unsupported_clocks(profile, &clocks);
                if missing.is_empty() {
                    println!("  GPU {:<20}OK ({} clocks)", dev, clocks.len());
                } else {
                    println!("  GPU {:<20}PROFILE CLOCKS NOT SUPPORTED: {:?}", dev, missing);
                    ok = false;
                }
            }
            Err(e) => {
                println!("  GPU {:<20}CLOCK QUERY FAILED ({})", dev, e);
                ok = false;
            }
        }
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        println!("  Pick a matching --profile or describe the card in a [profile] table");
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_table_supports_builtin_profile() {
        let p = DeviceProfile::builtin("v100-maxq").unwrap();
        assert!(unsupported_clocks(&p, &p.candidates).is_empty());
    }

    #[test]
    fn reports_missing_clocks_once() {
        let p = DeviceProfile::builtin("a100-insp").unwrap();
        let supported: Vec<u32> = p.candidates.iter().copied().filter(|&f| f != 1110).collect();
        assert_eq!(unsupported_clocks(&p, &supported), vec![1110]);
    }
}
