//! Impedance analyser capability and the sweep runner.
//!
//! Backends differ in how they produce data (one query per frequency, or a batch
//! technique streamed back as frames), but all of them present one reading per
//! frequency through [`ImpedanceAnalyser::measure_point`]. The [`AnalyserController`]
//! owns the retry policy: on a failed or malformed reading it probes the instrument at
//! [`PROBE_FREQUENCY_HZ`] and retries the frequency once.

use crate::error::{AppResult, VtiError};
use crate::estimate::SweepDurationModel;
use crate::events::{CancelFlag, StatusEvent, StatusKind, StatusSink};
use crate::planner::Direction;
use crate::telemetry::SweepWriter;
use anyhow::Result;
use async_trait::async_trait;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Frequency used to reset the instrument after a failed reading.
pub const PROBE_FREQUENCY_HZ: f64 = 1.0;

/// Operating envelope of an analyser.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalyserLimits {
    /// mV
    pub min_voltage: f64,
    /// mV
    pub max_voltage: f64,
    pub min_frequency: f64,
    pub max_frequency: f64,
}

/// One impedance value at one frequency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpedanceReading {
    pub frequency: f64,
    /// |Z| in ohms
    pub magnitude: f64,
    /// arg Z in degrees
    pub phase: f64,
    /// Raw backend fields kept alongside the derived values
    pub extra: Vec<f64>,
}

impl ImpedanceReading {
    /// Reading from an impedance given directly in polar form.
    pub fn polar(frequency: f64, magnitude: f64, phase: f64) -> Self {
        Self {
            frequency,
            magnitude,
            phase,
            extra: Vec::new(),
        }
    }

    /// Reading from voltage and current phasors: `Z = V / I`.
    pub fn from_phasors(frequency: f64, voltage: Complex64, current: Complex64) -> Self {
        let z = voltage / current;
        Self::polar(frequency, z.norm(), z.arg().to_degrees())
    }

    /// Reading from separately reported magnitudes and a phase difference in degrees.
    pub fn from_magnitudes(frequency: f64, voltage: f64, current: f64, phase: f64) -> Self {
        Self::polar(frequency, voltage / current, phase)
    }

    pub fn with_extra(mut self, extra: Vec<f64>) -> Self {
        self.extra = extra;
        self
    }

    /// Rejects readings carrying NaN or infinite values.
    pub fn validate(self) -> AppResult<Self> {
        let values = [self.frequency, self.magnitude, self.phase];
        if values.iter().chain(self.extra.iter()).all(|v| v.is_finite()) {
            Ok(self)
        } else {
            Err(VtiError::MalformedReading {
                frequency: self.frequency,
                reason: "non-finite value in reading".to_string(),
            })
        }
    }
}

/// A reading together with the conditions it was taken under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub reading: ImpedanceReading,
    pub cell_temperature: f64,
    pub direction: Direction,
}

impl SweepResult {
    /// Data row as written to the sweep file: `freq,|Z|,phase[,extra...]`.
    pub fn to_row(&self) -> String {
        let r = &self.reading;
        let mut fields = vec![
            r.frequency.to_string(),
            r.magnitude.to_string(),
            r.phase.to_string(),
        ];
        fields.extend(r.extra.iter().map(|v| v.to_string()));
        fields.join(",")
    }
}

/// Capability of an impedance analyser.
#[async_trait]
pub trait ImpedanceAnalyser: Send + Sync {
    fn name(&self) -> &str;

    fn limits(&self) -> AnalyserLimits;

    /// Time model used to estimate how long a sweep takes on this instrument.
    fn duration_model(&self) -> Box<dyn SweepDurationModel>;

    /// Configures amplitude (mV) and the frequency list of the coming sweep.
    async fn prepare(&self, voltage: f64, frequencies: &[f64]) -> Result<()>;

    /// Measures point `index` of the prepared list.
    ///
    /// A reading that arrived but cannot be interpreted is reported as
    /// [`VtiError::MalformedReading`] wrapped in the returned error.
    async fn measure_point(&self, index: usize, frequency: f64) -> Result<ImpedanceReading>;

    /// Measures once at `frequency` and discards the result.
    async fn probe(&self, frequency: f64) -> Result<()> {
        self.measure_point(0, frequency).await.map(|_| ())
    }

    /// Releases the instrument after a sweep, whether it completed or not.
    async fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Everything needed to run one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRequest {
    pub voltage: f64,
    pub frequencies: Vec<f64>,
    pub cell_temperature: f64,
    pub direction: Direction,
}

/// How a sweep ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepStatus {
    Completed(Vec<SweepResult>),
    /// Cancelled between frequencies; holds the results taken so far.
    Cancelled(Vec<SweepResult>),
}

impl SweepStatus {
    pub fn results(&self) -> &[SweepResult] {
        match self {
            SweepStatus::Completed(r) | SweepStatus::Cancelled(r) => r,
        }
    }
}

/// Runs sweeps on one analyser.
#[derive(Clone)]
pub struct AnalyserController {
    analyser: Arc<dyn ImpedanceAnalyser>,
    sink: Arc<dyn StatusSink>,
    cancel: CancelFlag,
}

impl AnalyserController {
    pub fn new(
        analyser: Arc<dyn ImpedanceAnalyser>,
        sink: Arc<dyn StatusSink>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            analyser,
            sink,
            cancel,
        }
    }

    /// Measures every frequency of `request` in order, appending each result to
    /// `writer` as soon as it is taken.
    pub async fn measure_sweep(
        &self,
        request: &SweepRequest,
        writer: &mut SweepWriter,
    ) -> AppResult<SweepStatus> {
        self.analyser
            .prepare(request.voltage, &request.frequencies)
            .await
            .map_err(VtiError::hardware)?;

        let outcome = self.measure_all(request, writer).await;
        if let Err(e) = self.analyser.finish().await {
            match outcome {
                Ok(_) => return Err(VtiError::hardware(e)),
                Err(_) => warn!(error = %e, "Analyser cleanup after failed sweep also failed"),
            }
        }
        outcome
    }

    async fn measure_all(
        &self,
        request: &SweepRequest,
        writer: &mut SweepWriter,
    ) -> AppResult<SweepStatus> {
        let total = request.frequencies.len();
        let mut results = Vec::with_capacity(total);

        for (index, &frequency) in request.frequencies.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(taken = results.len(), total, "Sweep cancelled");
                return Ok(SweepStatus::Cancelled(results));
            }
            self.sink.emit(StatusEvent::new(
                StatusKind::Scan {
                    index,
                    total,
                    frequency,
                },
                format!("Measuring {:.3e} Hz ({} / {})", frequency, index + 1, total),
                false,
            ))?;

            let reading = self.measure_with_retry(index, frequency).await?;
            let result = SweepResult {
                reading,
                cell_temperature: request.cell_temperature,
                direction: request.direction,
            };
            writer.append(&result)?;
            results.push(result);
        }

        debug!(total, "Sweep completed");
        Ok(SweepStatus::Completed(results))
    }

    async fn measure_with_retry(&self, index: usize, frequency: f64) -> AppResult<ImpedanceReading> {
        let first_error = match self.read(index, frequency).await {
            Ok(reading) => return Ok(reading),
            Err(e) => e,
        };

        warn!(frequency, error = %first_error, "Reading failed, probing and retrying");
        self.sink.emit(StatusEvent::logged(
            StatusKind::Warning,
            format!(
                "Measurement at {:.3e} Hz failed ({}), probing at {} Hz and retrying",
                frequency, first_error, PROBE_FREQUENCY_HZ
            ),
        ))?;

        if let Err(e) = self.analyser.probe(PROBE_FREQUENCY_HZ).await {
            error!(frequency, error = %e, "Probe failed");
            return Err(VtiError::SweepAborted {
                frequency,
                reason: format!("probe at {} Hz failed: {:#}", PROBE_FREQUENCY_HZ, e),
            });
        }

        self.read(index, frequency).await.map_err(|e| {
            error!(frequency, error = %e, "Retry failed");
            VtiError::SweepAborted {
                frequency,
                reason: e.to_string(),
            }
        })
    }

    async fn read(&self, index: usize, frequency: f64) -> AppResult<ImpedanceReading> {
        let reading = self
            .analyser
            .measure_point(index, frequency)
            .await
            .map_err(|e| match e.downcast::<VtiError>() {
                Ok(malformed @ VtiError::MalformedReading { .. }) => malformed,
                Ok(other) => VtiError::Hardware(other.to_string()),
                Err(e) => VtiError::hardware(e),
            })?;
        reading.validate()
    }

    /// Runs the sweep on its own task.
    pub fn spawn(&self, request: SweepRequest, mut writer: SweepWriter) -> SweepTask {
        let controller = self.clone();
        let handle =
            tokio::spawn(async move { controller.measure_sweep(&request, &mut writer).await });
        SweepTask { handle }
    }
}

/// A sweep running in the background.
pub struct SweepTask {
    handle: JoinHandle<AppResult<SweepStatus>>,
}

impl SweepTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> AppResult<SweepStatus> {
        self.handle.await?
    }
}
