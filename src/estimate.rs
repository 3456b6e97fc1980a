//! Run-time estimation and pre-run operator warnings.

use crate::planner::Ramp;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Room temperature assumed at the start of a run (°C).
pub const AMBIENT_TEMPERATURE: f64 = 22.0;

/// Runs longer than this get a warning.
pub const LONG_RUN: Duration = Duration::from_secs(2 * 3600);

/// Ramps ending at or above this need the cooling water on (°C).
pub const COOLING_WATER_THRESHOLD: f64 = 200.0;

/// Empirical time model of one sweep on a particular analyser.
pub trait SweepDurationModel: Send + Sync {
    /// Fixed cost of every frequency point (s).
    fn per_point_overhead(&self) -> f64;

    /// Integration time at `frequency` (s).
    fn point_time(&self, frequency: f64) -> f64;

    /// Estimated seconds for one sweep over `frequencies`.
    fn sweep_seconds(&self, frequencies: &[f64]) -> f64 {
        frequencies
            .iter()
            .map(|&f| self.per_point_overhead() + self.point_time(f))
            .sum()
    }
}

/// Solartron 1260 in single-sweep mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolartronModel;

impl SweepDurationModel for SolartronModel {
    fn per_point_overhead(&self) -> f64 {
        1.8047
    }

    fn point_time(&self, frequency: f64) -> f64 {
        1.0025 / frequency
    }
}

/// Biologic SP-200 running PEIS.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sp200Model;

impl SweepDurationModel for Sp200Model {
    fn per_point_overhead(&self) -> f64 {
        17.6
    }

    fn point_time(&self, f: f64) -> f64 {
        -3.12e-8 * f.powi(3) + 5.37e-5 * f.powi(2) - 3e-2 * f + 23.6 / f - 31.1 / f.powi(2)
            + 18.4 / f.powi(3)
    }
}

/// Something the operator should check before starting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OperatorWarning {
    /// The run is expected to take more than [`LONG_RUN`].
    LongRun { estimated: Duration },
    /// A ramp ends hot enough to need the cooling water.
    CoolingWater { ramp: usize },
    /// A ramp ends at or below ambient and needs the cooling pump.
    CoolingPump { ramp: usize },
}

impl fmt::Display for OperatorWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorWarning::LongRun { estimated } => write!(
                f,
                "Estimated run time is {} h, make sure the equipment can be left unattended",
                estimated.as_secs() / 3600
            ),
            OperatorWarning::CoolingWater { ramp } => write!(
                f,
                "Ramp {} ends at or above {} °C, turn the cooling water on",
                ramp, COOLING_WATER_THRESHOLD
            ),
            OperatorWarning::CoolingPump { ramp } => write!(
                f,
                "Ramp {} ends at or below {} °C, connect the cooling pump",
                ramp, AMBIENT_TEMPERATURE
            ),
        }
    }
}

/// Time estimate for a set of ramps.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    /// Rounded up to the whole minute
    pub total: Duration,
    /// Unrounded seconds per ramp, heating included
    pub per_ramp: Vec<f64>,
    pub warnings: Vec<OperatorWarning>,
}

/// Estimates the duration of running `ramps` in order from ambient.
pub fn estimate(ramps: &[Ramp], model: &dyn SweepDurationModel) -> Estimate {
    let mut previous_end = AMBIENT_TEMPERATURE;
    let mut per_ramp = Vec::with_capacity(ramps.len());
    let mut warnings = Vec::new();

    for ramp in ramps {
        let spec = ramp.spec();
        let heating_minutes = ((spec.start_temp - previous_end).abs()
            + (spec.end_temp - spec.start_temp).abs())
            / ramp.rate();

        let sweeps = ramp.num_sweeps() as f64;
        let per_point = match ramp.num_sweeps() {
            0 => ramp.min_holdtime() as f64,
            _ => {
                ramp.min_holdtime() as f64
                    + (sweeps - 1.0) * ramp.sweep_delay() as f64
                    + sweeps * model.sweep_seconds(ramp.frequency_list())
            }
        };
        per_ramp.push(heating_minutes * 60.0 + per_point * ramp.temperature_points().len() as f64);

        if spec.end_temp >= COOLING_WATER_THRESHOLD {
            warnings.push(OperatorWarning::CoolingWater { ramp: ramp.index() });
        }
        if spec.end_temp <= AMBIENT_TEMPERATURE {
            warnings.push(OperatorWarning::CoolingPump { ramp: ramp.index() });
        }
        previous_end = spec.end_temp;
    }

    let seconds: f64 = per_ramp.iter().sum();
    let total = Duration::from_secs(((seconds / 60.0).ceil().max(0.0) as u64) * 60);
    if total > LONG_RUN {
        warnings.insert(0, OperatorWarning::LongRun { estimated: total });
    }

    Estimate {
        total,
        per_ramp,
        warnings,
    }
}
