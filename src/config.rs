//! Settings loaded with Figment.
//!
//! Sources, lowest precedence first:
//! 1. `vti.toml` (or the path given on the command line)
//! 2. Environment variables prefixed with `VTI_`, nested keys separated by `__`
//!
//! ```text
//! VTI_APPLICATION__LOG_LEVEL=debug
//! VTI_HARDWARE__ANALYSER=solartron1260
//! VTI_TIMING__POLL_INTERVAL_MS=500
//! ```
//!
//! Every section has defaults, so an empty file gives a virtual setup with no ramps.

use crate::error::{AppResult, VtiError};
use crate::experiment::ExperimentTiming;
use crate::planner::{Ramp, RampSpec};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "vti.toml";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub solartron: SolartronConfig,
    /// Ramps run in the order listed
    #[serde(default)]
    pub ramps: Vec<RampSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Parent of every experiment directory
    #[serde(default = "default_experiments_dir")]
    pub experiments_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reach_grace")]
    pub reach_grace_ms: u64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    #[default]
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnalyserKind {
    #[default]
    Virtual,
    Solartron1260,
    Sp200,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HardwareConfig {
    #[serde(default)]
    pub stage: StageKind,
    #[serde(default)]
    pub analyser: AnalyserKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolartronConfig {
    /// VISA resource string, e.g. `GPIB0::4::INSTR`
    #[serde(default = "default_solartron_resource")]
    pub resource: String,
    /// Integration time (s)
    #[serde(default = "default_integration_time")]
    pub integration_time: u32,
    /// D.C. bias (V)
    #[serde(default)]
    pub dc_bias: f64,
    #[serde(default = "default_solartron_timeout")]
    pub timeout_ms: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_experiments_dir() -> PathBuf {
    PathBuf::from("experiments")
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_reach_grace() -> u64 {
    3000
}

fn default_sample_interval() -> u64 {
    1000
}

fn default_solartron_resource() -> String {
    "GPIB0::4::INSTR".to_string()
}

fn default_integration_time() -> u32 {
    1
}

fn default_solartron_timeout() -> u64 {
    30_000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            experiments_dir: default_experiments_dir(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            reach_grace_ms: default_reach_grace(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

impl Default for SolartronConfig {
    fn default() -> Self {
        Self {
            resource: default_solartron_resource(),
            integration_time: default_integration_time(),
            dc_bias: 0.0,
            timeout_ms: default_solartron_timeout(),
        }
    }
}

impl TimingConfig {
    pub fn to_experiment_timing(&self) -> ExperimentTiming {
        ExperimentTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reach_grace: Duration::from_millis(self.reach_grace_ms),
            sample_interval: Duration::from_millis(self.sample_interval_ms),
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Settings {
    /// Loads `vti.toml` from the working directory plus `VTI_` overrides.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Loads a specific file plus `VTI_` overrides, then validates.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VTI_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Checks the log level, the timing values and that every ramp expands.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(VtiError::fault(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let timing = [
            ("poll_interval_ms", self.timing.poll_interval_ms),
            ("sample_interval_ms", self.timing.sample_interval_ms),
        ];
        if let Some((name, _)) = timing.iter().find(|(_, v)| *v == 0) {
            return Err(VtiError::fault(format!("{} must be greater than 0", name)));
        }

        self.ramps()?;
        Ok(())
    }

    /// The configured ramps, numbered from 1.
    pub fn ramps(&self) -> AppResult<Vec<Ramp>> {
        Ok(Ramp::sequence(self.ramps.iter().cloned())?)
    }

    /// A starter configuration with one heating and one cooling ramp.
    pub fn example() -> Self {
        let heat = RampSpec::default();
        let cool = heat.reversed();
        Self {
            ramps: vec![heat, cool],
            ..Self::default()
        }
    }
}
