//! Biologic SP-200 potentiostat running potentio EIS.
//!
//! The whole sweep is loaded as one technique (`peis4.ecc`) and the channel streams
//! frames back while it runs. Only frames from process index 1 carry impedance data;
//! anything else is dropped. The EC-Lab development library itself sits behind
//! [`EcLabChannel`].
//!
//! Frames cannot be requested again once consumed, so the frame taken for a point
//! index is kept until the next index is asked for. A retry at the same index reads
//! that frame again instead of pulling the next frequency's data.

use crate::analyser::{AnalyserLimits, ImpedanceAnalyser, ImpedanceReading};
use crate::error::VtiError;
use crate::estimate::{Sp200Model, SweepDurationModel};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, trace, warn};

/// Technique file for potentio electrochemical impedance spectroscopy.
pub const PEIS_TECHNIQUE: &str = "peis4.ecc";

/// Process index of frames carrying impedance points.
pub const IMPEDANCE_PROCESS: i32 = 1;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fixed part of the wait for one impedance frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(30);

/// Signal periods allowed per point on top of [`FRAME_TIMEOUT`].
const FRAME_TIMEOUT_PERIODS: f64 = 10.0;

/// Typed technique parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EccValue {
    Single(f32),
    Int(i32),
    Bool(bool),
}

/// One labelled technique parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct EccParam {
    pub label: &'static str,
    pub value: EccValue,
    pub index: i32,
}

impl EccParam {
    fn new(label: &'static str, value: EccValue) -> Self {
        Self {
            label,
            value,
            index: 0,
        }
    }
}

/// Parameters of a logarithmic PEIS sweep from `fmax` down to `fmin`.
pub fn peis_parameters(voltage: f64, frequencies: &[f64]) -> Vec<EccParam> {
    let fmax = frequencies.first().copied().unwrap_or_default();
    let fmin = frequencies.last().copied().unwrap_or_default();
    vec![
        EccParam::new("Final_frequency", EccValue::Single(fmin as f32)),
        EccParam::new("Initial_frequency", EccValue::Single(fmax as f32)),
        EccParam::new("sweep", EccValue::Bool(false)),
        EccParam::new("Amplitude_Voltage", EccValue::Single(voltage as f32)),
        EccParam::new(
            "Frequency_number",
            EccValue::Int(i32::try_from(frequencies.len()).unwrap_or(i32::MAX)),
        ),
        EccParam::new("Average_N_times", EccValue::Int(1)),
        EccParam::new("Correction", EccValue::Bool(false)),
        EccParam::new("Wait_for_steady", EccValue::Single(0.1)),
    ]
}

/// One block returned by the channel's data call, already converted to floats.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub process_index: i32,
    pub values: Vec<f32>,
}

/// One channel of an EC-Lab instrument.
#[async_trait]
pub trait EcLabChannel: Send + Sync {
    async fn load_technique(&self, technique: &str, params: &[EccParam]) -> Result<()>;
    async fn start_channel(&self) -> Result<()>;
    /// Returns the next frame; an empty frame means no data is ready yet.
    async fn get_data(&self) -> Result<DataFrame>;
    async fn stop_channel(&self) -> Result<()>;
}

pub struct Sp200 {
    channel: Box<dyn EcLabChannel>,
    /// Point index and frame of the last impedance frame taken.
    current: Mutex<Option<(usize, DataFrame)>>,
}

impl Sp200 {
    pub fn new(channel: Box<dyn EcLabChannel>) -> Self {
        Self {
            channel,
            current: Mutex::new(None),
        }
    }

    /// Frame for point `index`, polling the channel only the first time it is asked for.
    async fn frame_for(&self, index: usize, frequency: f64) -> Result<DataFrame> {
        let mut current = self.current.lock().await;
        if let Some((taken, frame)) = current.as_ref() {
            if *taken == index {
                debug!(index, "Re-reading SP-200 frame");
                return Ok(frame.clone());
            }
        }

        let limit = frame_timeout(frequency);
        let frame = timeout(limit, self.next_impedance_frame())
            .await
            .map_err(|_| {
                warn!(index, frequency, "No SP-200 frame arrived");
                anyhow::anyhow!(
                    "no SP-200 impedance frame for {} Hz within {:?}",
                    frequency,
                    limit
                )
            })??;
        *current = Some((index, frame.clone()));
        Ok(frame)
    }

    async fn next_impedance_frame(&self) -> Result<DataFrame> {
        loop {
            let frame = self.channel.get_data().await.context("polling SP-200 data")?;
            if frame.process_index == IMPEDANCE_PROCESS && !frame.values.is_empty() {
                return Ok(frame);
            }
            trace!(process = frame.process_index, "Discarding SP-200 frame");
            sleep(POLL_INTERVAL).await;
        }
    }
}

fn frame_timeout(frequency: f64) -> Duration {
    let periods = if frequency > 0.0 {
        FRAME_TIMEOUT_PERIODS / frequency
    } else {
        0.0
    };
    FRAME_TIMEOUT + Duration::from_secs_f64(periods)
}

/// Converts `[freq, |Ewe|, |I|, phase, ...]` to a reading.
fn reading_from_frame(expected: f64, frame: &DataFrame) -> Result<ImpedanceReading, VtiError> {
    match frame.values.as_slice() {
        [f, ewe, i, phase, ..] => {
            let (ewe, i) = (f64::from(*ewe).abs(), f64::from(*i).abs());
            ImpedanceReading::from_magnitudes(f64::from(*f), ewe, i, f64::from(*phase))
                .with_extra(vec![ewe, i])
                .validate()
        }
        values => Err(VtiError::MalformedReading {
            frequency: expected,
            reason: format!("frame has {} values, expected 4", values.len()),
        }),
    }
}

#[async_trait]
impl ImpedanceAnalyser for Sp200 {
    fn name(&self) -> &str {
        "Biologic SP-200"
    }

    fn limits(&self) -> AnalyserLimits {
        AnalyserLimits {
            min_voltage: 1e-6,
            max_voltage: 1e4,
            min_frequency: 1e-5,
            max_frequency: 7e6,
        }
    }

    fn duration_model(&self) -> Box<dyn SweepDurationModel> {
        Box::new(Sp200Model)
    }

    async fn prepare(&self, voltage: f64, frequencies: &[f64]) -> Result<()> {
        let params = peis_parameters(voltage, frequencies);
        *self.current.lock().await = None;
        self.channel
            .load_technique(PEIS_TECHNIQUE, &params)
            .await
            .context("loading PEIS technique")?;
        self.channel.start_channel().await.context("starting SP-200 channel")?;
        debug!(points = frequencies.len(), "PEIS technique started");
        Ok(())
    }

    async fn measure_point(&self, index: usize, frequency: f64) -> Result<ImpedanceReading> {
        let frame = self.frame_for(index, frequency).await?;
        Ok(reading_from_frame(frequency, &frame)?)
    }

    /// The technique cannot be re-triggered mid-run, so there is nothing to reset.
    async fn probe(&self, _frequency: f64) -> Result<()> {
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        self.channel.stop_channel().await.context("stopping SP-200 channel")
    }
}
