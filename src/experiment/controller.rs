//! Top-level run loop.
//!
//! One control task walks the ramps, drives the stage through every set-point and
//! runs the sweeps, while the sampler task logs the temperature once per second.
//! The control task is the only writer of the [`ExperimentSnapshot`]; observers read
//! it through a watch channel and receive every [`StatusEvent`] on a broadcast
//! channel.
//!
//! Every path out of the loop (completion, cancellation, fatal error) stops the
//! stage and persists `complete` and `time_elapsed` to `details.json` before the task
//! ends.

use super::sampler::TemperatureSampler;
use super::state::{ExperimentSnapshot, RunPhase, ScanProgress};
use crate::analyser::{AnalyserController, ImpedanceAnalyser, SweepRequest, SweepStatus, SweepTask};
use crate::error::{AppResult, VtiError};
use crate::estimate::{estimate, Estimate};
use crate::events::{CancelFlag, StatusEvent, StatusKind, StatusSink};
use crate::planner::{validate_against, Ramp};
use crate::stage::{StageController, StageOutcome, StagePhase, StageTiming, TemperatureStage};
use crate::telemetry::{
    format_hms, ExperimentRecord, LogContext, SweepHeader, TelemetryRecorder, TemperatureSample,
};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Step of the between-sweeps countdown.
const DELAY_TICK: Duration = Duration::from_secs(1);

/// Poll periods of the run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExperimentTiming {
    /// Stage polls and sweep liveness checks
    pub poll_interval: Duration,
    /// Pause after every `begin_heating`
    pub reach_grace: Duration,
    /// Temperature log period
    pub sample_interval: Duration,
}

impl Default for ExperimentTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reach_grace: Duration::from_secs(3),
            sample_interval: Duration::from_secs(1),
        }
    }
}

impl ExperimentTiming {
    fn stage_timing(&self) -> StageTiming {
        StageTiming {
            poll_interval: self.poll_interval,
            reach_grace: self.reach_grace,
        }
    }
}

/// Hardware and storage a run works with.
pub struct ExperimentContext {
    pub stage: Arc<dyn TemperatureStage>,
    pub analyser: Arc<dyn ImpedanceAnalyser>,
    pub recorder: TelemetryRecorder,
    pub timing: ExperimentTiming,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentOutcome {
    Completed { elapsed: Duration },
    Cancelled { elapsed: Duration },
}

/// Publishes status: updates the snapshot, appends first emissions to the experiment
/// log and forwards every event to subscribers.
struct ExperimentReporter {
    recorder: TelemetryRecorder,
    started: Instant,
    snapshot: watch::Sender<ExperimentSnapshot>,
    temperature: watch::Receiver<Option<TemperatureSample>>,
    events: broadcast::Sender<StatusEvent>,
}

impl ExperimentReporter {
    fn update(&self, f: impl FnOnce(&mut ExperimentSnapshot)) {
        self.snapshot.send_modify(f);
    }

    fn log(&self, kind: StatusKind, message: impl Into<String>) -> AppResult<()> {
        self.emit(StatusEvent::logged(kind, message))
    }
}

impl StatusSink for ExperimentReporter {
    fn emit(&self, event: StatusEvent) -> AppResult<()> {
        let temperature = self.temperature.borrow().map(|s| s.temperature);
        let mut context = LogContext::default();
        self.snapshot.send_modify(|s| {
            s.status = event.message.clone();
            s.elapsed = self.started.elapsed();
            if temperature.is_some() {
                s.temperature = temperature;
            }
            match event.kind {
                StatusKind::Stage(phase) => s.stage_phase = Some(phase),
                StatusKind::Scan {
                    index,
                    total,
                    frequency,
                } => {
                    s.scan = Some(ScanProgress {
                        index,
                        total,
                        frequency,
                    })
                }
                _ => {}
            }
            context = LogContext {
                ramp: s.ramp,
                num_ramps: s.num_ramps,
                set_point: s.set_point.map(|t| (t, s.point, s.num_points)),
                temperature: s.temperature,
            };
        });

        match event.kind {
            StatusKind::Warning | StatusKind::ReachRetry { .. } => warn!("{}", event.message),
            StatusKind::Error => error!("{}", event.message),
            _ if event.first => info!("{}", event.message),
            _ => debug!("{}", event.message),
        }

        if event.first {
            self.recorder.append_log(&context, &event.message)?;
        }
        // No subscribers is fine
        let _ = self.events.send(event);
        Ok(())
    }
}

enum Flow {
    Completed,
    Cancelled,
}

/// Validated ramps plus the hardware to run them on.
pub struct ExperimentController {
    context: ExperimentContext,
    ramps: Vec<Ramp>,
    notes: String,
}

impl ExperimentController {
    /// Checks every ramp against the stage and analyser limits.
    pub fn new(context: ExperimentContext, ramps: Vec<Ramp>, notes: impl Into<String>) -> AppResult<Self> {
        if ramps.is_empty() {
            return Err(VtiError::fault("No ramps"));
        }
        let stage_limits = context.stage.limits();
        let analyser_limits = context.analyser.limits();
        for ramp in &ramps {
            validate_against(ramp, &stage_limits, &analyser_limits)?;
        }
        Ok(Self {
            context,
            ramps,
            notes: notes.into(),
        })
    }

    pub fn ramps(&self) -> &[Ramp] {
        &self.ramps
    }

    /// Run-time estimate using the analyser's sweep model.
    pub fn estimate(&self) -> Estimate {
        estimate(&self.ramps, self.context.analyser.duration_model().as_ref())
    }

    /// Writes the initial record and log headers, then starts the control and sampler
    /// tasks. Must be called from within a Tokio runtime.
    pub fn start(self) -> AppResult<ExperimentHandle> {
        let estimate = self.estimate();
        let ExperimentContext {
            stage,
            analyser,
            recorder,
            timing,
        } = self.context;

        let record = ExperimentRecord {
            experiment_name: recorder.name().to_string(),
            notes: self.notes,
            datetime: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            complete: false,
            stage: stage.name().to_string(),
            analyser: analyser.name().to_string(),
            ramps: self
                .ramps
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?,
            estimated_time: format_hms(estimate.total),
            time_elapsed: None,
        };
        recorder.write_record(&record)?;
        recorder.start_log()?;
        recorder.start_temperature_log()?;

        let started = Instant::now();
        let cancel = CancelFlag::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(ExperimentSnapshot {
            num_ramps: self.ramps.len(),
            ..ExperimentSnapshot::default()
        });
        let (temperature_tx, temperature_rx) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let reporter = Arc::new(ExperimentReporter {
            recorder: recorder.clone(),
            started,
            snapshot: snapshot_tx,
            temperature: temperature_rx.clone(),
            events: events_tx.clone(),
        });
        for warning in &estimate.warnings {
            reporter.log(StatusKind::Warning, warning.to_string())?;
        }

        let sampler = TemperatureSampler::spawn(
            stage.clone(),
            recorder.clone(),
            timing.sample_interval,
            started,
            temperature_tx,
        );

        let run = Run {
            stage,
            analyser,
            recorder: recorder.clone(),
            timing,
            ramps: self.ramps,
            reporter,
            cancel: cancel.clone(),
        };
        info!(experiment = recorder.name(), estimate = %format_hms(estimate.total), "Experiment started");
        let task = tokio::spawn(run.execute(sampler));

        Ok(ExperimentHandle {
            name: recorder.name().to_string(),
            dir: recorder.dir().to_path_buf(),
            cancel,
            snapshot: snapshot_rx,
            temperature: temperature_rx,
            events: events_tx,
            task,
        })
    }
}

/// State owned by the control task.
struct Run {
    stage: Arc<dyn TemperatureStage>,
    analyser: Arc<dyn ImpedanceAnalyser>,
    recorder: TelemetryRecorder,
    timing: ExperimentTiming,
    ramps: Vec<Ramp>,
    reporter: Arc<ExperimentReporter>,
    cancel: CancelFlag,
}

impl Run {
    async fn execute(self, sampler: TemperatureSampler) -> AppResult<ExperimentOutcome> {
        self.reporter.update(|s| s.phase = RunPhase::Running);
        let result = match self.reporter.log(StatusKind::Lifecycle, "Experiment is Starting.") {
            Ok(()) => self.run_ramps().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(Flow::Completed) => self.complete(sampler).await,
            Ok(Flow::Cancelled) => self.stop(sampler).await,
            Err(e) => {
                self.abort(sampler, &e).await;
                Err(e)
            }
        }
    }

    async fn run_ramps(&self) -> AppResult<Flow> {
        let analyser = AnalyserController::new(
            self.analyser.clone(),
            self.reporter.clone(),
            self.cancel.clone(),
        );

        for ramp in &self.ramps {
            let ramp_dir = self
                .recorder
                .create_ramp_dir(ramp.index(), ramp.direction())?;
            let points = ramp.temperature_points();
            self.reporter.update(|s| {
                s.ramp = ramp.index();
                s.num_points = points.len();
                s.point = 0;
                s.set_point = None;
                s.num_sweeps = ramp.num_sweeps();
            });
            debug!(ramp = ramp.index(), points = points.len(), "Ramp started");

            for (j, &target) in points.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Ok(Flow::Cancelled);
                }
                self.reporter.update(|s| {
                    s.point = j + 1;
                    s.set_point = Some(target);
                    s.sweep = 0;
                    s.scan = None;
                    s.stage_phase = None;
                });

                let stage = StageController::new(
                    self.stage.as_ref(),
                    self.reporter.as_ref(),
                    &self.cancel,
                    self.timing.stage_timing(),
                );
                if stage
                    .run_setpoint(target, ramp.rate(), ramp.min_holdtime())
                    .await?
                    == StageOutcome::Cancelled
                {
                    return Ok(Flow::Cancelled);
                }
                self.reporter
                    .update(|s| s.stage_phase = Some(StagePhase::Done));

                if let Flow::Cancelled = self.run_sweeps(&analyser, ramp, &ramp_dir, target).await? {
                    return Ok(Flow::Cancelled);
                }

                self.stage.toggle_hold().await.map_err(VtiError::hardware)?;
            }
        }
        Ok(Flow::Completed)
    }

    async fn run_sweeps(
        &self,
        analyser: &AnalyserController,
        ramp: &Ramp,
        ramp_dir: &Path,
        set_point: f64,
    ) -> AppResult<Flow> {
        let total = ramp.num_sweeps();
        if total == 0 {
            self.reporter
                .log(StatusKind::Sweep, "No sweeps to be carried during this ramp.")?;
            return Ok(Flow::Completed);
        }

        for k in 1..=total {
            if k > 1 && self.sweep_delay(ramp.sweep_delay()).await? {
                return Ok(Flow::Cancelled);
            }
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            let cell_temperature = self
                .stage
                .read_temperature()
                .await
                .map_err(VtiError::hardware)?;
            self.reporter.update(|s| {
                s.sweep = k;
                s.scan = None;
            });
            self.reporter
                .log(StatusKind::Sweep, format!("Beginning sweep {} / {}.", k, total))?;

            let writer = self.recorder.create_sweep_file(
                ramp_dir,
                &SweepHeader {
                    sweep_number: k,
                    cell_temperature,
                    set_point,
                    direction: ramp.direction(),
                },
            )?;
            let task = analyser.spawn(
                SweepRequest {
                    voltage: ramp.voltage(),
                    frequencies: ramp.frequency_list().to_vec(),
                    cell_temperature,
                    direction: ramp.direction(),
                },
                writer,
            );
            self.reporter.log(
                StatusKind::Sweep,
                format!("Performing sweep {} / {}.", k, total),
            )?;

            if let SweepStatus::Cancelled(_) = self.wait_for(task).await? {
                return Ok(Flow::Cancelled);
            }
        }
        Ok(Flow::Completed)
    }

    /// Counts down `seconds`; returns true if cancelled meanwhile.
    async fn sweep_delay(&self, seconds: u64) -> AppResult<bool> {
        for remaining in (1..=seconds).rev() {
            self.reporter.emit(StatusEvent::new(
                StatusKind::SweepDelay,
                format!("Waiting to perform next impedance sweep, t = {}s", remaining),
                remaining == seconds,
            ))?;
            sleep(DELAY_TICK).await;
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn wait_for(&self, task: SweepTask) -> AppResult<SweepStatus> {
        while !task.is_finished() {
            sleep(self.timing.poll_interval).await;
        }
        task.join().await
    }

    fn elapsed(&self) -> Duration {
        self.reporter.started.elapsed()
    }

    async fn complete(self, sampler: TemperatureSampler) -> AppResult<ExperimentOutcome> {
        self.reporter.update(|s| s.phase = RunPhase::Completing);
        let stopped = self.stop_stage().await;

        let elapsed = self.elapsed();
        self.reporter.log(StatusKind::Lifecycle, "Experiment Complete")?;
        self.persist(true, elapsed)?;

        self.wrap_up(sampler).await;
        self.reporter.update(|s| {
            s.phase = RunPhase::Terminal;
            s.complete = true;
        });
        stopped?;
        info!(elapsed = %format_hms(elapsed), "Experiment complete");
        Ok(ExperimentOutcome::Completed { elapsed })
    }

    async fn stop(self, sampler: TemperatureSampler) -> AppResult<ExperimentOutcome> {
        self.reporter.update(|s| {
            s.phase = RunPhase::Stopping;
            s.cancelled = true;
        });
        let stopped = self.stop_stage().await;

        let elapsed = self.elapsed();
        self.persist(false, elapsed)?;
        self.reporter
            .log(StatusKind::Lifecycle, "Stop requested / user interrupt.")?;

        self.wrap_up(sampler).await;
        self.reporter.update(|s| s.phase = RunPhase::Terminal);
        stopped?;
        info!(elapsed = %format_hms(elapsed), "Experiment stopped");
        Ok(ExperimentOutcome::Cancelled { elapsed })
    }

    /// Stops the stage, logging a failure before handing it back.
    async fn stop_stage(&self) -> AppResult<()> {
        let Err(e) = self.stage.stop_heating().await else {
            return Ok(());
        };
        let err = VtiError::hardware(e);
        error!(error = %err, "Stage did not stop");
        self.reporter
            .log(StatusKind::Error, format!("Could not stop stage: {}", err))?;
        Err(err)
    }

    async fn abort(self, sampler: TemperatureSampler, cause: &VtiError) {
        error!(error = %cause, "Experiment aborted");
        if let Err(e) = self
            .reporter
            .log(StatusKind::Error, format!("Experiment aborted: {}", cause))
        {
            warn!(error = %e, "Could not log abort");
        }
        if let Err(e) = self.stage.stop_heating().await {
            warn!(error = %e, "Could not stop stage after failure");
        }
        if let Err(e) = self.persist(false, self.elapsed()) {
            warn!(error = %e, "Could not persist record after failure");
        }
        sampler.stop().await;
        self.reporter.update(|s| s.phase = RunPhase::Terminal);
    }

    fn persist(&self, complete: bool, elapsed: Duration) -> AppResult<()> {
        self.recorder.update_record(|r| {
            r.complete = complete;
            r.time_elapsed = Some(format_hms(elapsed));
        })
    }

    /// Stops the sampler, collects the stage log and renders the profile plot.
    /// Failures here are reported as warnings.
    async fn wrap_up(&self, sampler: TemperatureSampler) {
        sampler.stop().await;

        if let Err(e) = self.stage.collect_log(self.recorder.dir()).await {
            let _ = self
                .reporter
                .log(StatusKind::Warning, format!("Could not collect stage log: {:#}", e));
        }

        let plotted = self
            .recorder
            .read_temperature_log()
            .and_then(|samples| self.recorder.render_profile(&samples));
        if let Err(e) = plotted {
            let _ = self.reporter.log(
                StatusKind::Warning,
                format!("Temperature profile plot failed: {}", e),
            );
        }
    }
}

/// Control surface of a running experiment.
pub struct ExperimentHandle {
    name: String,
    dir: PathBuf,
    cancel: CancelFlag,
    snapshot: watch::Receiver<ExperimentSnapshot>,
    temperature: watch::Receiver<Option<TemperatureSample>>,
    events: broadcast::Sender<StatusEvent>,
    task: JoinHandle<AppResult<ExperimentOutcome>>,
}

impl ExperimentHandle {
    /// Final experiment name, after de-duplication.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Requests a stop at the next poll boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Receiver of state snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ExperimentSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> ExperimentSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Latest temperature sample.
    pub fn temperature(&self) -> Option<TemperatureSample> {
        *self.temperature.borrow()
    }

    /// Receiver of status events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> AppResult<ExperimentOutcome> {
        self.task.await?
    }
}
