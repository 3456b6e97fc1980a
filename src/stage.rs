//! Temperature stage capability and the per-set-point state machine.
//!
//! The controller drives a stage through **Reaching → Settling → Holding → Done** for
//! one set-point. Reaching restarts until the stage reports a hold within the coarse
//! band around the target; there is no iteration cap, but every
//! [`REACH_RETRY_WARNING`] restarts a warning event is emitted.

use crate::error::{AppResult, VtiError};
use crate::events::{CancelFlag, StatusEvent, StatusKind, StatusSink};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Half-width (°C) of the band a stage hold must fall in to count as reached.
pub const COARSE_BAND: f64 = 1.0;

/// Emit a warning every this many Reaching restarts.
pub const REACH_RETRY_WARNING: u32 = 10;

/// Step of the hold countdown.
pub const HOLD_TICK: Duration = Duration::from_secs(1);

/// Operating envelope of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageLimits {
    /// °C
    pub min_temp: f64,
    /// °C
    pub max_temp: f64,
    /// °C/min
    pub min_rate: f64,
    /// °C/min
    pub max_rate: f64,
}

/// Capability of a programmable hot stage.
///
/// The stage runs its own ramp once `begin_heating` is issued; the controller only
/// observes. A positive `read_hold_remaining` means the stage believes it has reached
/// the target and is counting down its own hold timer.
#[async_trait]
pub trait TemperatureStage: Send + Sync {
    /// Name stored in `details.json`.
    fn name(&self) -> &str;

    /// Accepted set-point and rate range.
    fn limits(&self) -> StageLimits;

    /// Starts ramping to `target` at `rate` °C/min, then holding for `holdtime` s.
    async fn begin_heating(&self, target: f64, rate: f64, holdtime: u64) -> Result<()>;

    async fn stop_heating(&self) -> Result<()>;

    async fn read_temperature(&self) -> Result<f64>;

    /// Seconds left on the stage's hold timer, 0.0 while still ramping.
    async fn read_hold_remaining(&self) -> Result<f64>;

    /// Toggles the stage's indefinite hold at the current temperature.
    async fn toggle_hold(&self) -> Result<()>;

    /// Acceptable deviation from `target` once holding.
    fn tolerance_for(&self, target: f64) -> f64;

    /// Whether to wait for the fine tolerance before the hold countdown.
    fn supports_fine_hold(&self) -> bool {
        true
    }

    /// Moves any vendor log file into `dir`.
    async fn collect_log(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Phase of the set-point state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagePhase {
    Reaching,
    Settling,
    Holding,
    Done,
}

/// Poll timing of the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageTiming {
    pub poll_interval: Duration,
    /// Pause after `begin_heating` before the hold timer is trusted.
    pub reach_grace: Duration,
}

impl Default for StageTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reach_grace: Duration::from_secs(3),
        }
    }
}

/// How a set-point ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Done,
    Cancelled,
}

/// Drives one stage through the set-point state machine.
pub struct StageController<'a> {
    stage: &'a dyn TemperatureStage,
    sink: &'a dyn StatusSink,
    cancel: &'a CancelFlag,
    timing: StageTiming,
}

impl<'a> StageController<'a> {
    pub fn new(
        stage: &'a dyn TemperatureStage,
        sink: &'a dyn StatusSink,
        cancel: &'a CancelFlag,
        timing: StageTiming,
    ) -> Self {
        Self {
            stage,
            sink,
            cancel,
            timing,
        }
    }

    /// Brings the stage to `target` and holds it for `min_holdtime` seconds.
    ///
    /// The stage is left in its indefinite hold on `Done`; the caller releases it
    /// with `toggle_hold` once the sweeps are finished.
    pub async fn run_setpoint(
        &self,
        target: f64,
        rate: f64,
        min_holdtime: u64,
    ) -> AppResult<StageOutcome> {
        info!(target, rate, min_holdtime, "Set-point started");

        if self.reach(target, rate, min_holdtime).await? == StageOutcome::Cancelled {
            return Ok(StageOutcome::Cancelled);
        }
        if self.settle(target).await? == StageOutcome::Cancelled {
            return Ok(StageOutcome::Cancelled);
        }
        if self.hold(min_holdtime).await? == StageOutcome::Cancelled {
            return Ok(StageOutcome::Cancelled);
        }

        debug!(target, "Set-point done");
        Ok(StageOutcome::Done)
    }

    async fn reach(&self, target: f64, rate: f64, holdtime: u64) -> AppResult<StageOutcome> {
        let mut attempts: u32 = 0;
        loop {
            self.stage
                .begin_heating(target, rate, holdtime)
                .await
                .map_err(VtiError::hardware)?;
            self.emit(
                StatusKind::Stage(StagePhase::Reaching),
                format!("Heating/Cooling to {} °C", target),
                attempts == 0,
            )?;

            if self.pause(self.timing.reach_grace).await {
                return Ok(StageOutcome::Cancelled);
            }
            loop {
                let remaining = self
                    .stage
                    .read_hold_remaining()
                    .await
                    .map_err(VtiError::hardware)?;
                if remaining > 0.0 {
                    break;
                }
                if self.pause(self.timing.poll_interval).await {
                    return Ok(StageOutcome::Cancelled);
                }
            }

            let temperature = self.read_temperature().await?;
            if (temperature - target).abs() <= COARSE_BAND {
                return Ok(StageOutcome::Done);
            }

            attempts += 1;
            debug!(target, temperature, attempts, "Stage held outside coarse band");
            if attempts % REACH_RETRY_WARNING == 0 {
                warn!(target, attempts, "Stage keeps holding away from set-point");
                self.emit(
                    StatusKind::ReachRetry { attempts },
                    format!(
                        "Stage has held away from {} °C {} times, still retrying",
                        target, attempts
                    ),
                    true,
                )?;
            }
        }
    }

    async fn settle(&self, target: f64) -> AppResult<StageOutcome> {
        self.stage
            .toggle_hold()
            .await
            .map_err(VtiError::hardware)?;
        if !self.stage.supports_fine_hold() {
            return Ok(StageOutcome::Done);
        }

        let tolerance = self.stage.tolerance_for(target);
        let mut first = true;
        loop {
            let temperature = self.read_temperature().await?;
            if (temperature - target).abs() <= tolerance {
                return Ok(StageOutcome::Done);
            }
            self.emit(
                StatusKind::Stage(StagePhase::Settling),
                format!("Settling at {} °C, T = {:.2} °C", target, temperature),
                first,
            )?;
            first = false;
            if self.pause(self.timing.poll_interval).await {
                return Ok(StageOutcome::Cancelled);
            }
        }
    }

    async fn hold(&self, min_holdtime: u64) -> AppResult<StageOutcome> {
        let mut remaining = min_holdtime;
        loop {
            let temperature = self.read_temperature().await?;
            self.emit(
                StatusKind::Stage(StagePhase::Holding),
                format!(
                    "Holding at T = {:.2} °C, Holdtime Remaining = {} (s)",
                    temperature, remaining
                ),
                remaining == min_holdtime,
            )?;
            if remaining == 0 {
                return Ok(StageOutcome::Done);
            }
            if self.pause(HOLD_TICK).await {
                return Ok(StageOutcome::Cancelled);
            }
            remaining -= 1;
        }
    }

    async fn read_temperature(&self) -> AppResult<f64> {
        self.stage
            .read_temperature()
            .await
            .map_err(VtiError::hardware)
    }

    /// Sleeps, then reports whether cancellation was requested.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::time::sleep(duration).await;
        self.cancel.is_cancelled()
    }

    fn emit(&self, kind: StatusKind, message: String, first: bool) -> AppResult<()> {
        self.sink.emit(StatusEvent::new(kind, message, first))
    }
}
