//! Solartron 1260 frequency response analyser.
//!
//! One query per frequency: set the frequency, trigger a single measurement, switch
//! the display source to `Z1 = V1/I`, then read back the last result as ASCII.

use super::adapter::Adapter;
use crate::analyser::{AnalyserLimits, ImpedanceAnalyser, ImpedanceReading};
use crate::error::VtiError;
use crate::estimate::{SolartronModel, SweepDurationModel};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

/// Connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SolartronOptions {
    /// D.C. bias (V)
    pub dc_bias: f64,
    /// Integration time (s)
    pub integration_time: u32,
    /// Pause after every command so the instrument can keep up
    pub command_delay: Duration,
    /// Pause after the reset commands
    pub reset_delay: Duration,
}

impl Default for SolartronOptions {
    fn default() -> Self {
        Self {
            dc_bias: 0.0,
            integration_time: 1,
            command_delay: Duration::from_millis(100),
            reset_delay: Duration::from_secs(2),
        }
    }
}

/// Frequencies below this (Hz) need an extra wait after triggering.
const SLOW_FREQUENCY: f64 = 3.0;

pub struct Solartron1260 {
    adapter: Mutex<Box<dyn Adapter>>,
    options: SolartronOptions,
}

impl Solartron1260 {
    /// Resets the instrument and configures inputs, outputs and integration.
    pub async fn connect(adapter: Box<dyn Adapter>, options: SolartronOptions) -> Result<Self> {
        let this = Self {
            adapter: Mutex::new(adapter),
            options,
        };

        for command in ["*RST", "*CLS", "TT 2"] {
            this.send(command).await?;
        }
        sleep(this.options.reset_delay).await;

        let setup = [
            "OS 0".to_string(),
            "OT 0".to_string(),
            "OP 2,1".to_string(),
            "CZ 1".to_string(),
            "UW 1".to_string(),
            "IP 1,1".to_string(),
            "OU 1,0".to_string(),
            "IP 2,1".to_string(),
            "OU 2,0".to_string(),
            format!("VB {:?}", this.options.dc_bias),
            "DC 1,0".to_string(),
            "DC 3,0".to_string(),
            "RA 1,0".to_string(),
            format!("IS {}", this.options.integration_time),
        ];
        for command in &setup {
            this.send(command).await?;
        }

        info!("Solartron 1260 configured");
        Ok(this)
    }

    async fn send(&self, command: &str) -> Result<()> {
        self.adapter
            .lock()
            .await
            .write(command)
            .await
            .with_context(|| format!("sending '{}' to Solartron 1260", command))?;
        sleep(self.options.command_delay).await;
        Ok(())
    }

    async fn query_frequency(&self, frequency: f64) -> Result<ImpedanceReading> {
        self.send(&format!("FR {:.1E}", frequency)).await?;
        self.send("SI").await?;
        if frequency < SLOW_FREQUENCY {
            sleep(Duration::from_secs_f64(1.0 / (frequency + 2.0))).await;
        }
        self.send("SO 1,3").await?;
        self.send("DO").await?;
        sleep(Duration::from_millis(50)).await;

        let line = self
            .adapter
            .lock()
            .await
            .read_line()
            .await
            .with_context(|| format!("reading result at {} Hz", frequency))?;
        debug!(frequency, reply = %line, "Solartron reply");
        Ok(parse_response(frequency, &line)?)
    }
}

/// Parses `freq,|Z|,phase,...`; the fourth field is kept as extra data, the rest is
/// padding.
pub fn parse_response(frequency: f64, line: &str) -> Result<ImpedanceReading, VtiError> {
    let malformed = |reason: String| VtiError::MalformedReading { frequency, reason };

    let fields = line
        .trim()
        .split(',')
        .take(4)
        .map(|f| f.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| malformed(format!("'{}': {}", line.trim(), e)))?;

    match fields.as_slice() {
        [f, magnitude, phase, extra @ ..] => ImpedanceReading::polar(*f, *magnitude, *phase)
            .with_extra(extra.to_vec())
            .validate(),
        _ => Err(malformed(format!(
            "expected at least 3 fields, got '{}'",
            line.trim()
        ))),
    }
}

#[async_trait]
impl ImpedanceAnalyser for Solartron1260 {
    fn name(&self) -> &str {
        "Solartron 1260"
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
        Box::new(SolartronModel)
    }

    async fn prepare(&self, voltage: f64, _frequencies: &[f64]) -> Result<()> {
        // VA takes volts
        self.send(&format!("VA {:?}", voltage / 1000.0)).await
    }

    async fn measure_point(&self, _index: usize, frequency: f64) -> Result<ImpedanceReading> {
        self.query_frequency(frequency).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::adapter::ScriptedAdapter;

    async fn connected(script: &ScriptedAdapter) -> Solartron1260 {
        Solartron1260::connect(Box::new(script.clone()), SolartronOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_setup_sequence() {
        let script = ScriptedAdapter::new();
        connected(&script).await;

        let written = script.written();
        assert_eq!(&written[..3], &["*RST", "*CLS", "TT 2"]);
        assert!(written.contains(&"VB 0.0".to_string()));
        assert_eq!(written.last().map(String::as_str), Some("IS 1"));
        assert_eq!(written.len(), 17);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_point_query_sequence() {
        let script = ScriptedAdapter::new();
        let analyser = connected(&script).await;
        script.reply("+1.0000E+03,+2.5000E+02,-1.2000E+01,+0.0000E+00,+0.0000E+00");

        let reading = analyser.measure_point(0, 1000.0).await.unwrap();
        assert_eq!(reading.frequency, 1000.0);
        assert_eq!(reading.magnitude, 250.0);
        assert_eq!(reading.phase, -12.0);
        assert_eq!(reading.extra, vec![0.0]);

        let written = script.written();
        assert_eq!(&written[17..], &["FR 1.0E3", "SI", "SO 1,3", "DO"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbled_reply_is_malformed() {
        let script = ScriptedAdapter::new();
        let analyser = connected(&script).await;
        script.reply("+1.0000E+03,##");

        let err = analyser.measure_point(0, 1000.0).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VtiError>(),
            Some(VtiError::MalformedReading { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_short_reply() {
        assert!(parse_response(10.0, "1.0,2.0").is_err());
        assert!(parse_response(10.0, "").is_err());
    }
}
