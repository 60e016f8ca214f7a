// GEEPAFS CONFIGURATION FILE
// OPTIONAL TOML OVERRIDES ON TOP OF THE BUILT-IN DEFAULTS:
//
//   [control]            ANY ControlParams FIELD, e.g. probe_interval_ms = 12000
//   [profile]            A COMPLETE CUSTOM DEVICE PROFILE (REPLACES --profile)

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::tuning::{ControlParams, DeviceProfile};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub control: ControlParams,
    pub profile: Option<DeviceProfile>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg: FileConfig = toml::from_str(text).context("invalid configuration")?;
        cfg.control = cfg.control.sanitized();
        if let Some(profile) = &cfg.profile {
            profile.validate()?;
        }
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_defaults() {
        let cfg = FileConfig::parse("").unwrap();
        assert_eq!(cfg.control, ControlParams::default());
        assert!(cfg.profile.is_none());
    }

    #[test]
    fn partial_control_override() {
        let cfg = FileConfig::parse("[control]\nprobe_interval_ms = 12000\nthorough = true\n").unwrap();
        assert_eq!(cfg.control.probe_interval_ms, 12_000);
        assert!(cfg.control.thorough);
        assert_eq!(cfg.control.tick_period_ms, 300);
    }

    #[test]
    fn custom_profile() {
        let text = r#"
[profile]
name = "lab-card"
min_set_mhz = 600
avg_eff_mhz = 700
max_mhz = 1000
mem_mhz = 900
ladder = [600, 700, 800, 900, 1000]
candidates = [500, 600, 700, 800, 900, 1000]
"#;
        let cfg = FileConfig::parse(text).unwrap();
        let p = cfg.profile.unwrap();
        assert_eq!(p.name, "lab-card");
        assert_eq!(p.ladder_len(), 5);
    }

    #[test]
    fn invalid_profile_rejected() {
        let text = r#"
[profile]
name = "broken"
min_set_mhz = 600
avg_eff_mhz = 700
max_mhz = 1050
mem_mhz = 900
ladder = [600, 700]
candidates = [600, 700, 1000]
"#;
        let err = FileConfig::parse(text).unwrap_err();
        assert!(format!("{:#}", err).contains("1050"), "{:#}", err);
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(FileConfig::parse("[control]\nprobe_delay = 5\n").is_err());
    }

    #[test]
    fn nonsense_values_sanitized() {
        let cfg = FileConfig::parse("[control]\nwindow = 0\nmeasurement_lag = 0\n").unwrap();
        assert_eq!(cfg.control.window, 1);
        assert_eq!(cfg.control.measurement_lag, 1);
    }

    #[test]
    fn missing_file() {
        let err = FileConfig::load("/nonexistent/geepafs.toml").unwrap_err();
        assert!(format!("{:#}", err).contains("failed to read"));
    }
}
