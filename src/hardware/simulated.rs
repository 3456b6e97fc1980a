//! Simulated stage and analyser.
//!
//! Both run on `tokio::time`, so tests with a paused clock execute hours of
//! experiment in milliseconds.
//!
//! - `SimulatedStage` ramps linearly at the requested rate from where it is, reports a
//!   positive hold timer once the target is reached and freezes at the current
//!   temperature while held.
//! - `SimulatedAnalyser` measures a series resistor in front of a parallel RC cell and
//!   takes `overhead + 1/f` seconds per point. Faults can be injected per frequency.

use crate::analyser::{AnalyserLimits, ImpedanceAnalyser, ImpedanceReading};
use crate::error::VtiError;
use crate::estimate::SweepDurationModel;
use crate::estimate::AMBIENT_TEMPERATURE;
use crate::stage::{StageLimits, TemperatureStage};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// SimulatedStage
// =============================================================================

#[derive(Debug)]
struct StageState {
    origin: f64,
    target: f64,
    /// °C/min
    rate: f64,
    since: Instant,
    heating: bool,
    held_at: Option<f64>,
    holdtime: u64,
    premature_holds: u32,
    begin_count: u32,
    toggle_count: u32,
    stop_count: u32,
}

impl StageState {
    fn travel_time(&self) -> f64 {
        (self.target - self.origin).abs() / (self.rate / 60.0)
    }

    fn temperature(&self, now: Instant) -> f64 {
        if let Some(held) = self.held_at {
            return held;
        }
        if !self.heating {
            return self.origin;
        }
        let elapsed = now.duration_since(self.since).as_secs_f64();
        if elapsed >= self.travel_time() {
            self.target
        } else {
            let direction = (self.target - self.origin).signum();
            self.origin + direction * self.rate / 60.0 * elapsed
        }
    }
}

/// Hot stage model starting at room temperature.
pub struct SimulatedStage {
    state: Mutex<StageState>,
    limits: StageLimits,
}

impl SimulatedStage {
    pub fn new() -> Self {
        Self::starting_at(AMBIENT_TEMPERATURE)
    }

    pub fn starting_at(temperature: f64) -> Self {
        Self {
            state: Mutex::new(StageState {
                origin: temperature,
                target: temperature,
                rate: 10.0,
                since: Instant::now(),
                heating: false,
                held_at: None,
                holdtime: 0,
                premature_holds: 0,
                begin_count: 0,
                toggle_count: 0,
                stop_count: 0,
            }),
            limits: StageLimits {
                min_temp: 0.0,
                max_temp: 500.0,
                min_rate: 1.0,
                max_rate: 30.0,
            },
        }
    }

    /// Makes the next `count` hold-timer reads report a hold before the target is
    /// reached, the way a real controller does right after a set-point change.
    pub fn with_premature_holds(self, count: u32) -> Self {
        lock(&self.state).premature_holds = count;
        self
    }

    pub fn begin_count(&self) -> u32 {
        lock(&self.state).begin_count
    }

    pub fn toggle_count(&self) -> u32 {
        lock(&self.state).toggle_count
    }

    pub fn stop_count(&self) -> u32 {
        lock(&self.state).stop_count
    }

    pub fn is_heating(&self) -> bool {
        lock(&self.state).heating
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemperatureStage for SimulatedStage {
    fn name(&self) -> &str {
        "Virtual Stage"
    }

    fn limits(&self) -> StageLimits {
        self.limits
    }

    async fn begin_heating(&self, target: f64, rate: f64, holdtime: u64) -> Result<()> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        state.origin = state.temperature(now);
        state.target = target;
        state.rate = rate;
        state.since = now;
        state.heating = true;
        state.held_at = None;
        state.holdtime = holdtime;
        state.begin_count += 1;
        debug!(from = state.origin, target, rate, "Simulated stage heating");
        Ok(())
    }

    async fn stop_heating(&self) -> Result<()> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        state.origin = state.temperature(now);
        state.heating = false;
        state.held_at = None;
        state.stop_count += 1;
        Ok(())
    }

    async fn read_temperature(&self) -> Result<f64> {
        Ok(lock(&self.state).temperature(Instant::now()))
    }

    async fn read_hold_remaining(&self) -> Result<f64> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        if !state.heating {
            return Ok(0.0);
        }
        if state.premature_holds > 0 {
            state.premature_holds -= 1;
            return Ok(1.0);
        }
        let elapsed = now.duration_since(state.since).as_secs_f64();
        let travel = state.travel_time();
        if elapsed < travel {
            return Ok(0.0);
        }
        Ok((state.holdtime as f64 - (elapsed - travel)).max(1.0))
    }

    async fn toggle_hold(&self) -> Result<()> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let current = state.temperature(now);
        if state.held_at.is_some() {
            state.origin = current;
            state.target = current;
            state.since = now;
            state.held_at = None;
        } else {
            state.held_at = Some(current);
        }
        state.toggle_count += 1;
        Ok(())
    }

    fn tolerance_for(&self, _target: f64) -> f64 {
        0.1
    }

    fn supports_fine_hold(&self) -> bool {
        false
    }
}

// =============================================================================
// SimulatedAnalyser
// =============================================================================

/// Calls seen by a [`SimulatedAnalyser`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyserCall {
    Prepare { voltage: f64, points: usize },
    Measure(f64),
    Probe(f64),
    Finish,
}

/// Injected failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The read fails outright.
    Error,
    /// A reply arrives but cannot be parsed.
    Malformed,
}

/// Sweep time model of the simulated analyser.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedModel {
    overhead: f64,
}

impl SweepDurationModel for SimulatedModel {
    fn per_point_overhead(&self) -> f64 {
        self.overhead
    }

    fn point_time(&self, frequency: f64) -> f64 {
        1.0 / frequency
    }
}

/// Analyser measuring `Rs + (Rp || C)`.
pub struct SimulatedAnalyser {
    series_resistance: f64,
    parallel_resistance: f64,
    capacitance: f64,
    overhead: f64,
    voltage: Mutex<f64>,
    rng: Mutex<Option<(StdRng, f64)>>,
    faults: Mutex<HashMap<u64, (Fault, u32)>>,
    calls: Mutex<Vec<AnalyserCall>>,
}

impl SimulatedAnalyser {
    pub fn new() -> Self {
        Self {
            series_resistance: 100.0,
            parallel_resistance: 1e5,
            capacitance: 1e-9,
            overhead: 2.0,
            voltage: Mutex::new(0.0),
            rng: Mutex::new(None),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Adds multiplicative noise of relative size `level` to |Z|.
    pub fn with_noise(self, seed: u64, level: f64) -> Self {
        *lock(&self.rng) = Some((StdRng::seed_from_u64(seed), level));
        self
    }

    /// Fixed time added to every point (s).
    pub fn with_overhead(mut self, seconds: f64) -> Self {
        self.overhead = seconds;
        self
    }

    /// Fails the next `times` reads at `frequency`.
    pub fn with_fault(self, frequency: f64, fault: Fault, times: u32) -> Self {
        lock(&self.faults).insert(frequency.to_bits(), (fault, times));
        self
    }

    pub fn calls(&self) -> Vec<AnalyserCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: AnalyserCall) {
        lock(&self.calls).push(call);
    }

    fn impedance(&self, frequency: f64) -> Complex64 {
        let omega = 2.0 * PI * frequency;
        let cell = Complex64::new(self.parallel_resistance, 0.0)
            / Complex64::new(1.0, omega * self.parallel_resistance * self.capacitance);
        cell + self.series_resistance
    }

    fn take_fault(&self, frequency: f64) -> Option<Fault> {
        let mut faults = lock(&self.faults);
        let (fault, remaining) = faults.get_mut(&frequency.to_bits())?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(*fault)
    }

    async fn sample(&self, frequency: f64) -> Result<ImpedanceReading> {
        sleep(Duration::from_secs_f64(self.overhead + 1.0 / frequency)).await;

        match self.take_fault(frequency) {
            Some(Fault::Error) => return Err(anyhow!("simulated read timeout at {} Hz", frequency)),
            Some(Fault::Malformed) => {
                return Err(VtiError::MalformedReading {
                    frequency,
                    reason: "simulated garbled reply".to_string(),
                }
                .into())
            }
            None => {}
        }

        let amplitude = *lock(&self.voltage) / 1000.0;
        let voltage = Complex64::new(amplitude, 0.0);
        let mut current = voltage / self.impedance(frequency);
        if let Some((rng, level)) = lock(&self.rng).as_mut() {
            current /= 1.0 + rng.gen_range(-*level..=*level);
        }
        Ok(ImpedanceReading::from_phasors(frequency, voltage, current))
    }
}

impl Default for SimulatedAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImpedanceAnalyser for SimulatedAnalyser {
    fn name(&self) -> &str {
        "Virtual Analyser"
    }

    fn limits(&self) -> AnalyserLimits {
        AnalyserLimits {
            min_voltage: 1e-6,
            max_voltage: 1e3,
            min_frequency: 1e-5,
            max_frequency: 3.2e7,
        }
    }

    fn duration_model(&self) -> Box<dyn SweepDurationModel> {
        Box::new(SimulatedModel {
            overhead: self.overhead,
        })
    }

    async fn prepare(&self, voltage: f64, frequencies: &[f64]) -> Result<()> {
        *lock(&self.voltage) = voltage;
        self.record(AnalyserCall::Prepare {
            voltage,
            points: frequencies.len(),
        });
        Ok(())
    }

    async fn measure_point(&self, _index: usize, frequency: f64) -> Result<ImpedanceReading> {
        self.record(AnalyserCall::Measure(frequency));
        self.sample(frequency).await
    }

    async fn probe(&self, frequency: f64) -> Result<()> {
        self.record(AnalyserCall::Probe(frequency));
        self.sample(frequency).await.map(|_| ())
    }

    async fn finish(&self) -> Result<()> {
        self.record(AnalyserCall::Finish);
        Ok(())
    }
}
