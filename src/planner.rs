//! Ramp planning.
//!
//! A ramp is the operator's description of one monotonic temperature excursion.
//! [`expand`] turns it into the ordered list of set-points the stage visits and the
//! descending frequency list every sweep on that ramp uses. The expansion is pure and
//! deterministic; all device-limit checks live in [`validate_against`] so that the
//! same ramp can be planned before any hardware is connected.

use crate::analyser::AnalyserLimits;
use crate::error::{AppResult, VtiError};
use crate::stage::StageLimits;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Cooling rates above this (°C/min) are clamped for descending ramps.
pub const MAX_COOLING_RATE: f64 = 15.0;

/// Shortest accepted gap between consecutive sweeps at one set-point (s).
pub const MIN_SWEEP_DELAY: u64 = 5;

/// Accepted minimum hold time range (s).
pub const HOLDTIME_RANGE: (u64, u64) = (1, 30_000_000);

/// Smallest accepted temperature step (°C).
pub const MIN_INTERVAL: f64 = 1.0;

const DIVISIBILITY_EPSILON: f64 = 1e-9;

/// Direction of a ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// `end_temp >= start_temp`
    Up,
    /// `end_temp < start_temp`
    Down,
}

impl Direction {
    /// Direction of travel from `start` to `end`. Flat ramps count as ascending.
    pub fn of(start: f64, end: f64) -> Self {
        if end >= start {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    /// Lowercase name used in directory names and sweep headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a ramp cannot be expanded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidRampError {
    #[error("interval {interval} does not evenly divide {start} -> {end}")]
    IntervalDoesNotDivide { start: f64, end: f64, interval: f64 },

    #[error("rate must be positive, got {0}")]
    NonPositiveRate(f64),

    #[error("points per decade must be at least 1, got {0}")]
    PointsPerDecade(u32),

    #[error("frequency range {fmin} Hz -> {fmax} Hz is invalid")]
    FrequencyRange { fmin: f64, fmax: f64 },

    #[error("no frequencies between {fmin} Hz and {fmax} Hz at {points_per_decade} points per decade")]
    EmptyFrequencyList {
        fmin: f64,
        fmax: f64,
        points_per_decade: u32,
    },

    #[error("{0} is not a finite number")]
    NonFinite(&'static str),
}

/// Operator-entered ramp parameters, before expansion.
///
/// Defaults match the values pre-filled on the ramp entry form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampSpec {
    /// Starting temperature (°C)
    pub start_temp: f64,
    /// Final temperature (°C)
    pub end_temp: f64,
    /// Heating or cooling rate (°C/min)
    pub rate: f64,
    /// Temperature step between set-points (°C); the sign is ignored
    pub interval: f64,
    /// Thermalisation dwell at every set-point before measuring (s)
    pub min_holdtime: u64,
    /// AC voltage amplitude (mV)
    pub voltage: f64,
    /// Lowest sweep frequency (Hz)
    pub fmin: f64,
    /// Highest sweep frequency (Hz)
    pub fmax: f64,
    /// Log-spaced points per frequency decade
    pub points_per_decade: u32,
    /// Sweeps taken at every set-point
    pub num_sweeps_at_temperature: u32,
    /// Wait between consecutive sweeps at one set-point (s)
    pub sweep_delay: u64,
    /// Whether the first set-point of the ramp is measured
    pub scan_at_first_temperature: bool,
}

impl Default for RampSpec {
    fn default() -> Self {
        Self {
            start_temp: 30.0,
            end_temp: 60.0,
            rate: 5.0,
            interval: 10.0,
            min_holdtime: 300,
            voltage: 50.0,
            fmin: 1e-1,
            fmax: 1e7,
            points_per_decade: 10,
            num_sweeps_at_temperature: 1,
            sweep_delay: 300,
            scan_at_first_temperature: true,
        }
    }
}

impl RampSpec {
    /// The same ramp travelled in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            start_temp: self.end_temp,
            end_temp: self.start_temp,
            ..self.clone()
        }
    }
}

/// Result of expanding a [`RampSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct RampPlan {
    pub direction: Direction,
    /// Rate after the cooling clamp
    pub rate: f64,
    /// Interval signed to match `direction`
    pub interval: f64,
    pub num_intervals: usize,
    /// Every set-point the stage passes through, first point included
    pub heating_path: Vec<f64>,
    /// Set-points at which the stage holds and sweeps are taken
    pub temperature_points: Vec<f64>,
    /// Sweep frequencies, descending from `fmax` to `fmin`
    pub frequency_list: Vec<f64>,
}

/// Expands a ramp into its set-points and sweep frequencies.
pub fn expand(spec: &RampSpec) -> Result<RampPlan, InvalidRampError> {
    let finite = [
        ("start_temp", spec.start_temp),
        ("end_temp", spec.end_temp),
        ("rate", spec.rate),
        ("interval", spec.interval),
        ("voltage", spec.voltage),
        ("fmin", spec.fmin),
        ("fmax", spec.fmax),
    ];
    if let Some((name, _)) = finite.iter().find(|(_, v)| !v.is_finite()) {
        return Err(InvalidRampError::NonFinite(name));
    }
    if spec.rate <= 0.0 {
        return Err(InvalidRampError::NonPositiveRate(spec.rate));
    }
    if spec.points_per_decade < 1 {
        return Err(InvalidRampError::PointsPerDecade(spec.points_per_decade));
    }

    let direction = Direction::of(spec.start_temp, spec.end_temp);
    let span = (spec.end_temp - spec.start_temp).abs();
    let step = spec.interval.abs();
    let not_dividing = InvalidRampError::IntervalDoesNotDivide {
        start: spec.start_temp,
        end: spec.end_temp,
        interval: spec.interval,
    };
    if step == 0.0 {
        return Err(not_dividing);
    }
    let steps = span / step;
    if (steps - steps.round()).abs() > DIVISIBILITY_EPSILON {
        return Err(not_dividing);
    }
    // steps is integral here, rounding only strips float noise.
    let num_intervals = steps.round() as usize;

    let interval = match direction {
        Direction::Up => step,
        Direction::Down => -step,
    };
    let rate = match direction {
        Direction::Down if spec.rate > MAX_COOLING_RATE => MAX_COOLING_RATE,
        _ => spec.rate,
    };

    let heating_path: Vec<f64> = (0..=num_intervals)
        .map(|k| round_centi(spec.start_temp + k as f64 * interval))
        .collect();
    let temperature_points = if spec.scan_at_first_temperature {
        heating_path.clone()
    } else {
        heating_path[1..].to_vec()
    };

    Ok(RampPlan {
        direction,
        rate,
        interval,
        num_intervals,
        heating_path,
        temperature_points,
        frequency_list: frequency_list(spec.fmin, spec.fmax, spec.points_per_decade)?,
    })
}

/// Log-spaced frequencies from `fmax` down to `fmin`.
///
/// The point count is `floor(points_per_decade * log10(fmax / fmin))`, both end points
/// included.
pub fn frequency_list(
    fmin: f64,
    fmax: f64,
    points_per_decade: u32,
) -> Result<Vec<f64>, InvalidRampError> {
    if !(fmin > 0.0) || !fmax.is_finite() || fmin >= fmax {
        return Err(InvalidRampError::FrequencyRange { fmin, fmax });
    }
    if points_per_decade < 1 {
        return Err(InvalidRampError::PointsPerDecade(points_per_decade));
    }

    let lo = fmin.log10();
    let hi = fmax.log10();
    let count = (points_per_decade as f64 * (hi - lo) + DIVISIBILITY_EPSILON).floor() as usize;

    match count {
        0 => Err(InvalidRampError::EmptyFrequencyList {
            fmin,
            fmax,
            points_per_decade,
        }),
        1 => Ok(vec![fmax]),
        n => {
            let step = (hi - lo) / (n - 1) as f64;
            Ok((0..n)
                .rev()
                .map(|i| match i {
                    0 => fmin,
                    i if i == n - 1 => fmax,
                    i => 10f64.powf(lo + i as f64 * step),
                })
                .collect())
        }
    }
}

fn round_centi(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A validated, immutable ramp.
///
/// Serializes to the ramp entry stored in `details.json`; the frequency list is left
/// out because `fmin`, `fmax` and `points_per_decade` reproduce it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ramp {
    index: usize,
    #[serde(flatten)]
    spec: RampSpec,
    direction: Direction,
    num_intervals: usize,
    num_points: usize,
    heating_path: Vec<f64>,
    temperature_points: Vec<f64>,
    #[serde(skip)]
    frequency_list: Vec<f64>,
}

impl Ramp {
    /// Expands `spec` and freezes it as ramp number `index` (1-based).
    ///
    /// The stored spec carries the clamped rate and the direction-signed interval.
    pub fn new(index: usize, spec: RampSpec) -> Result<Self, InvalidRampError> {
        let plan = expand(&spec)?;
        let spec = RampSpec {
            rate: plan.rate,
            interval: plan.interval,
            ..spec
        };
        Ok(Self {
            index,
            spec,
            direction: plan.direction,
            num_intervals: plan.num_intervals,
            num_points: plan.frequency_list.len(),
            heating_path: plan.heating_path,
            temperature_points: plan.temperature_points,
            frequency_list: plan.frequency_list,
        })
    }

    /// Builds ramps numbered from 1 in the order given.
    pub fn sequence(specs: impl IntoIterator<Item = RampSpec>) -> Result<Vec<Self>, InvalidRampError> {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Ramp::new(i + 1, spec))
            .collect()
    }

    /// 1-based position in the run.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> &RampSpec {
        &self.spec
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Ramp rate in °C/min after the cooling clamp.
    pub fn rate(&self) -> f64 {
        self.spec.rate
    }

    /// Set-point spacing, negative for descending ramps.
    pub fn interval(&self) -> f64 {
        self.spec.interval
    }

    pub fn min_holdtime(&self) -> u64 {
        self.spec.min_holdtime
    }

    /// Sweep amplitude in mV.
    pub fn voltage(&self) -> f64 {
        self.spec.voltage
    }

    /// Sweeps taken at every measured set-point.
    pub fn num_sweeps(&self) -> u32 {
        self.spec.num_sweeps_at_temperature
    }

    pub fn sweep_delay(&self) -> u64 {
        self.spec.sweep_delay
    }

    pub fn num_intervals(&self) -> usize {
        self.num_intervals
    }

    pub fn heating_path(&self) -> &[f64] {
        &self.heating_path
    }

    /// Set-points at which the stage holds and sweeps run.
    pub fn temperature_points(&self) -> &[f64] {
        &self.temperature_points
    }

    pub fn frequency_list(&self) -> &[f64] {
        &self.frequency_list
    }

    /// Directory name for this ramp's data, e.g. `2_down`.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.index, self.direction)
    }
}

/// Checks a ramp against the connected devices' limits.
///
/// Returns the first failing field as a [`VtiError::Configuration`] whose fault name
/// matches the label on the entry form.
pub fn validate_against(
    ramp: &Ramp,
    stage: &StageLimits,
    analyser: &AnalyserLimits,
) -> AppResult<()> {
    let spec = ramp.spec();
    let within = |v: f64, lo: f64, hi: f64| lo <= v && v <= hi;

    if !within(spec.start_temp, stage.min_temp, stage.max_temp) {
        return Err(VtiError::fault("Start Temp"));
    }
    if !within(spec.end_temp, stage.min_temp, stage.max_temp) {
        return Err(VtiError::fault("End Temp"));
    }
    if !within(spec.rate, stage.min_rate, stage.max_rate) {
        return Err(VtiError::fault("Rate"));
    }
    if spec.interval.abs() < MIN_INTERVAL {
        return Err(VtiError::fault("Interval"));
    }
    if !(HOLDTIME_RANGE.0..=HOLDTIME_RANGE.1).contains(&spec.min_holdtime) {
        return Err(VtiError::fault("Minimum Holdtime"));
    }
    validate_sweep(spec.voltage, spec.fmin, spec.fmax, analyser)?;
    if spec.sweep_delay < MIN_SWEEP_DELAY {
        return Err(VtiError::fault("Sweep Delay"));
    }
    Ok(())
}

/// Checks sweep amplitude (mV) and frequency range against an analyser.
pub fn validate_sweep(voltage: f64, fmin: f64, fmax: f64, analyser: &AnalyserLimits) -> AppResult<()> {
    if !(analyser.min_voltage <= voltage && voltage <= analyser.max_voltage) {
        return Err(VtiError::fault("Voltage"));
    }
    if fmin >= fmax {
        return Err(VtiError::fault("fmin >= fmax"));
    }
    if fmin < analyser.min_frequency {
        return Err(VtiError::fault("Minimum Frequency"));
    }
    if fmax > analyser.max_frequency {
        return Err(VtiError::fault("Maximum Frequency"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(start: f64, end: f64, interval: f64) -> RampSpec {
        RampSpec {
            start_temp: start,
            end_temp: end,
            interval,
            ..RampSpec::default()
        }
    }

    fn stage_limits() -> StageLimits {
        StageLimits {
            min_temp: 0.0,
            max_temp: 500.0,
            min_rate: 1.0,
            max_rate: 30.0,
        }
    }

    fn analyser_limits() -> AnalyserLimits {
        AnalyserLimits {
            min_voltage: 1.0,
            max_voltage: 100.0,
            min_frequency: 1e-5,
            max_frequency: 3.2e7,
        }
    }

    #[test]
    fn ascending_points() {
        let plan = expand(&spec(30.0, 60.0, 10.0)).unwrap();
        assert_eq!(plan.direction, Direction::Up);
        assert_eq!(plan.temperature_points, vec![30.0, 40.0, 50.0, 60.0]);
        assert_eq!(plan.num_intervals, 3);
    }

    #[test]
    fn descending_points_sign_the_interval() {
        let plan = expand(&spec(60.0, 30.0, 10.0)).unwrap();
        assert_eq!(plan.direction, Direction::Down);
        assert_eq!(plan.interval, -10.0);
        assert_eq!(plan.temperature_points, vec![60.0, 50.0, 40.0, 30.0]);
    }

    #[test]
    fn negative_interval_on_ascending_ramp_is_normalised() {
        let plan = expand(&spec(30.0, 60.0, -10.0)).unwrap();
        assert_eq!(plan.temperature_points, vec![30.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn fractional_interval_rounds_points() {
        let plan = expand(&spec(25.0, 26.0, 0.1)).unwrap();
        assert_eq!(plan.heating_path.len(), 11);
        assert_eq!(plan.heating_path[3], 25.3);
        assert_eq!(plan.heating_path[10], 26.0);
    }

    #[test]
    fn non_dividing_interval_is_rejected() {
        for (start, end, interval) in [(30.0, 60.0, 7.0), (60.0, 30.0, 7.0), (30.0, 35.0, 2.0)] {
            let err = expand(&spec(start, end, interval)).unwrap_err();
            assert!(matches!(err, InvalidRampError::IntervalDoesNotDivide { .. }));
        }
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(
            expand(&spec(30.0, 60.0, 0.0)),
            Err(InvalidRampError::IntervalDoesNotDivide { .. })
        ));
    }

    #[test]
    fn zero_rate_and_ppd_are_rejected() {
        let mut s = spec(30.0, 60.0, 10.0);
        s.rate = 0.0;
        assert_eq!(expand(&s), Err(InvalidRampError::NonPositiveRate(0.0)));

        let mut s = spec(30.0, 60.0, 10.0);
        s.points_per_decade = 0;
        assert_eq!(expand(&s), Err(InvalidRampError::PointsPerDecade(0)));
    }

    #[test]
    fn flat_ramp_has_single_point() {
        let plan = expand(&spec(45.0, 45.0, 5.0)).unwrap();
        assert_eq!(plan.num_intervals, 0);
        assert_eq!(plan.temperature_points, vec![45.0]);

        let mut skip_first = spec(45.0, 45.0, 5.0);
        skip_first.scan_at_first_temperature = false;
        let plan = expand(&skip_first).unwrap();
        assert!(plan.temperature_points.is_empty());
        assert_eq!(plan.heating_path, vec![45.0]);
    }

    #[test]
    fn skipping_first_point_keeps_heating_path() {
        let mut s = spec(30.0, 60.0, 10.0);
        s.scan_at_first_temperature = false;
        let plan = expand(&s).unwrap();
        assert_eq!(plan.temperature_points, vec![40.0, 50.0, 60.0]);
        assert_eq!(plan.heating_path, vec![30.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn cooling_rate_is_clamped_only_when_descending() {
        let mut up = spec(30.0, 60.0, 10.0);
        up.rate = 25.0;
        assert_eq!(expand(&up).unwrap().rate, 25.0);
        assert_eq!(expand(&up.reversed()).unwrap().rate, MAX_COOLING_RATE);
    }

    #[test]
    fn default_frequency_list() {
        let freqs = frequency_list(0.1, 1e7, 10).unwrap();
        assert_eq!(freqs.len(), 80);
        assert!(freqs.windows(2).all(|w| w[0] > w[1]));
        assert!((freqs[0] - 1e7).abs() / 1e7 < 1e-9);
        assert!((freqs[79] - 0.1).abs() / 0.1 < 1e-9);
    }

    #[test]
    fn frequency_list_rejects_inverted_range() {
        assert!(matches!(
            frequency_list(10.0, 1.0, 10),
            Err(InvalidRampError::FrequencyRange { .. })
        ));
        assert!(matches!(
            frequency_list(0.0, 1.0, 10),
            Err(InvalidRampError::FrequencyRange { .. })
        ));
        assert!(matches!(
            frequency_list(1.0, 2.0, 1),
            Err(InvalidRampError::EmptyFrequencyList { .. })
        ));
    }

    #[test]
    fn ramp_serializes_without_frequency_list() {
        let ramp = Ramp::new(1, spec(30.0, 60.0, 10.0)).unwrap();
        let json = serde_json::to_value(&ramp).unwrap();
        assert_eq!(json["index"], 1);
        assert_eq!(json["direction"], "up");
        assert_eq!(json["num_points"], 80);
        assert!(json.get("frequency_list").is_none());
        assert_eq!(ramp.dir_name(), "1_up");
    }

    #[test]
    fn sanity_check_reports_first_fault() {
        let ok = Ramp::new(1, spec(30.0, 60.0, 10.0)).unwrap();
        assert!(validate_against(&ok, &stage_limits(), &analyser_limits()).is_ok());

        let hot = Ramp::new(1, spec(30.0, 600.0, 10.0)).unwrap();
        let err = validate_against(&hot, &stage_limits(), &analyser_limits()).unwrap_err();
        assert!(matches!(err, VtiError::Configuration { ref fault } if fault == "End Temp"));

        let mut quick = spec(30.0, 60.0, 10.0);
        quick.sweep_delay = 2;
        let quick = Ramp::new(1, quick).unwrap();
        let err = validate_against(&quick, &stage_limits(), &analyser_limits()).unwrap_err();
        assert!(matches!(err, VtiError::Configuration { ref fault } if fault == "Sweep Delay"));

        let mut loud = spec(30.0, 60.0, 10.0);
        loud.voltage = 500.0;
        let loud = Ramp::new(1, loud).unwrap();
        let err = validate_against(&loud, &stage_limits(), &analyser_limits()).unwrap_err();
        assert!(matches!(err, VtiError::Configuration { ref fault } if fault == "Voltage"));
    }

    #[test]
    fn sweep_check_without_ramp() {
        let limits = analyser_limits();
        assert!(validate_sweep(50.0, 1.0, 1e5, &limits).is_ok());
        assert!(matches!(
            validate_sweep(50.0, 1e5, 1.0, &limits),
            Err(VtiError::Configuration { ref fault }) if fault == "fmin >= fmax"
        ));
        assert!(matches!(
            validate_sweep(50.0, 1.0, limits.max_frequency * 2.0, &limits),
            Err(VtiError::Configuration { ref fault }) if fault == "Maximum Frequency"
        ));
    }

    #[test]
    fn sequence_numbers_from_one() {
        let ramps = Ramp::sequence([spec(30.0, 60.0, 10.0), spec(60.0, 30.0, 10.0)]).unwrap();
        assert_eq!(ramps[0].index(), 1);
        assert_eq!(ramps[1].index(), 2);
        assert_eq!(ramps[1].dir_name(), "2_down");
    }
}
