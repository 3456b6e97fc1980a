//! End-to-end runs against the simulated stage and analyser.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use vti_daq::experiment::{ExperimentSnapshot, RunPhase};
use vti_daq::hardware::simulated::Fault;
use vti_daq::hardware::{SimulatedAnalyser, SimulatedStage};
use vti_daq::stage::{StageLimits, StagePhase, TemperatureStage};
use vti_daq::telemetry::TelemetryRecorder;
use vti_daq::{
    ExperimentContext, ExperimentController, ExperimentOutcome, ExperimentTiming, Ramp, RampSpec,
    VtiError,
};

fn spec(start: f64, end: f64) -> RampSpec {
    RampSpec {
        start_temp: start,
        end_temp: end,
        rate: 10.0,
        interval: 10.0,
        min_holdtime: 5,
        voltage: 50.0,
        fmin: 10.0,
        fmax: 1000.0,
        points_per_decade: 2,
        num_sweeps_at_temperature: 2,
        sweep_delay: 5,
        scan_at_first_temperature: true,
    }
}

fn context(
    root: &Path,
    stage: Arc<SimulatedStage>,
    analyser: SimulatedAnalyser,
) -> ExperimentContext {
    ExperimentContext {
        stage,
        analyser: Arc::new(analyser.with_overhead(0.5)),
        recorder: TelemetryRecorder::create(root, "run").unwrap(),
        timing: ExperimentTiming::default(),
    }
}

fn read(path: impl AsRef<Path>) -> String {
    fs::read_to_string(path).unwrap()
}

/// Simulated stage whose controller stops answering when told to stop.
struct StuckStage(SimulatedStage);

#[async_trait]
impl TemperatureStage for StuckStage {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn limits(&self) -> StageLimits {
        self.0.limits()
    }

    async fn begin_heating(&self, target: f64, rate: f64, holdtime: u64) -> Result<()> {
        self.0.begin_heating(target, rate, holdtime).await
    }

    async fn stop_heating(&self) -> Result<()> {
        bail!("stage comms lost")
    }

    async fn read_temperature(&self) -> Result<f64> {
        self.0.read_temperature().await
    }

    async fn read_hold_remaining(&self) -> Result<f64> {
        self.0.read_hold_remaining().await
    }

    async fn toggle_hold(&self) -> Result<()> {
        self.0.toggle_hold().await
    }

    fn tolerance_for(&self, target: f64) -> f64 {
        self.0.tolerance_for(target)
    }

    fn supports_fine_hold(&self) -> bool {
        self.0.supports_fine_hold()
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_run_produces_layout() {
    let root = TempDir::new().unwrap();
    let stage = Arc::new(SimulatedStage::new());
    let ramps = Ramp::sequence([spec(30.0, 40.0)]).unwrap();
    let controller = ExperimentController::new(
        context(root.path(), stage.clone(), SimulatedAnalyser::new()),
        ramps,
        "layout check",
    )
    .unwrap();

    let handle = controller.start().unwrap();
    let state = handle.subscribe();
    let dir = handle.dir().to_path_buf();
    let outcome = handle.join().await.unwrap();

    assert!(matches!(outcome, ExperimentOutcome::Completed { .. }));
    let snapshot: ExperimentSnapshot = state.borrow().clone();
    assert_eq!(snapshot.phase, RunPhase::Terminal);
    assert!(snapshot.complete);

    let details: serde_json::Value = serde_json::from_str(&read(dir.join("details.json"))).unwrap();
    assert_eq!(details["experiment_name"], "run");
    assert_eq!(details["notes"], "layout check");
    assert_eq!(details["complete"], true);
    assert_eq!(details["stage"], "Virtual Stage");
    assert_eq!(details["ramps"][0]["temperature_points"][1], 40.0);
    assert!(details["time_elapsed"].as_str().unwrap().contains(':'));

    let log = read(dir.join("experiment_log.txt"));
    assert!(log.starts_with("Experiment Log File for: run\n"));
    for line in [
        "Experiment is Starting.",
        "Heating/Cooling to 30 °C",
        "Heating/Cooling to 40 °C",
        "Beginning sweep 1 / 2.",
        "Beginning sweep 2 / 2.",
        "Performing sweep 2 / 2.",
        "Waiting to perform next impedance sweep, t = 5s",
        "Experiment Complete",
    ] {
        assert!(log.contains(line), "log is missing '{}'", line);
    }
    assert_eq!(log.matches("Waiting to perform next impedance sweep").count(), 2);
    assert!(log.contains("| Ramp : 1 / 1 | Temp Point : 40 °C 2 / 2 |"));

    for t in ["30", "40"] {
        for n in [1, 2] {
            let path = dir.join("1_up").join(format!("{}C", t)).join(format!("{}C_sweep_{}.txt", t, n));
            let content = read(&path);
            let lines: Vec<&str> = content.lines().collect();
            assert_eq!(lines[0], "sweep_num,date,time,Tcell,setT,direction");
            assert!(lines[1].starts_with(&format!("{},", n)));
            assert!(lines[1].ends_with(&format!(",{},up", t)));
            assert_eq!(lines.len(), 2 + 4, "{}", path.display());
            assert!(lines[2].starts_with("1000,"));
        }
    }

    let temperatures = read(dir.join("temperature_data.txt"));
    assert!(temperatures.starts_with("seconds, temperature\n"));
    assert!(temperatures.lines().count() > 60);

    assert!(
        dir.join("temp_profile.png").exists() || log.contains("Temperature profile plot failed")
    );
    assert_eq!(stage.stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_hold_persists_partial_run() {
    let root = TempDir::new().unwrap();
    let stage = Arc::new(SimulatedStage::new());
    let mut long_hold = spec(30.0, 60.0);
    long_hold.min_holdtime = 3600;
    let controller = ExperimentController::new(
        context(root.path(), stage.clone(), SimulatedAnalyser::new()),
        Ramp::sequence([long_hold]).unwrap(),
        "",
    )
    .unwrap();

    let handle = controller.start().unwrap();
    let mut state = handle.subscribe();
    state
        .wait_for(|s| s.stage_phase == Some(StagePhase::Holding))
        .await
        .unwrap();
    handle.cancel();

    let dir = handle.dir().to_path_buf();
    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, ExperimentOutcome::Cancelled { .. }));

    let details: serde_json::Value = serde_json::from_str(&read(dir.join("details.json"))).unwrap();
    assert_eq!(details["complete"], false);
    assert!(!details["time_elapsed"].as_str().unwrap().is_empty());

    assert!(stage.stop_count() >= 1);
    assert!(!stage.is_heating());

    let ramp_dir = dir.join("1_up");
    assert!(ramp_dir.is_dir());
    assert_eq!(fs::read_dir(&ramp_dir).unwrap().count(), 0);

    let log = read(dir.join("experiment_log.txt"));
    assert!(log.contains("Stop requested / user interrupt."));
    assert!(!log.contains("Experiment Complete"));
    assert!(state.borrow().cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_single_sweep_failure_is_recovered() {
    let root = TempDir::new().unwrap();
    let mut once = spec(30.0, 30.0);
    once.num_sweeps_at_temperature = 1;
    let analyser = SimulatedAnalyser::new().with_fault(1000.0, Fault::Malformed, 1);
    let controller = ExperimentController::new(
        context(root.path(), Arc::new(SimulatedStage::new()), analyser),
        Ramp::sequence([once]).unwrap(),
        "",
    )
    .unwrap();

    let handle = controller.start().unwrap();
    let dir = handle.dir().to_path_buf();
    handle.join().await.unwrap();

    let sweep = read(dir.join("1_up").join("30C").join("30C_sweep_1.txt"));
    assert_eq!(sweep.lines().count(), 2 + 4);
    let log = read(dir.join("experiment_log.txt"));
    assert!(log.contains("probing at 1 Hz and retrying"));
    assert!(log.contains("Experiment Complete"));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_sweep_failure_aborts_run() {
    let root = TempDir::new().unwrap();
    let stage = Arc::new(SimulatedStage::new());
    let analyser = SimulatedAnalyser::new().with_fault(1000.0, Fault::Error, 2);
    let controller = ExperimentController::new(
        context(root.path(), stage.clone(), analyser),
        Ramp::sequence([spec(30.0, 40.0)]).unwrap(),
        "",
    )
    .unwrap();

    let handle = controller.start().unwrap();
    let dir = handle.dir().to_path_buf();
    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, VtiError::SweepAborted { frequency, .. } if frequency == 1000.0));

    let details: serde_json::Value = serde_json::from_str(&read(dir.join("details.json"))).unwrap();
    assert_eq!(details["complete"], false);
    assert!(details["time_elapsed"].is_string());

    let sweep = read(dir.join("1_up").join("30C").join("30C_sweep_1.txt"));
    assert_eq!(sweep.lines().count(), 2);
    assert!(!dir.join("1_up").join("40C").exists());
    assert!(read(dir.join("experiment_log.txt")).contains("Experiment aborted"));
    assert!(stage.stop_count() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_sweeps_only_holds() {
    let root = TempDir::new().unwrap();
    let mut hold_only = spec(30.0, 40.0);
    hold_only.num_sweeps_at_temperature = 0;
    let analyser = Arc::new(SimulatedAnalyser::new());
    let controller = ExperimentController::new(
        ExperimentContext {
            stage: Arc::new(SimulatedStage::new()),
            analyser: analyser.clone(),
            recorder: TelemetryRecorder::create(root.path(), "hold").unwrap(),
            timing: ExperimentTiming::default(),
        },
        Ramp::sequence([hold_only]).unwrap(),
        "",
    )
    .unwrap();

    let handle = controller.start().unwrap();
    let dir = handle.dir().to_path_buf();
    handle.join().await.unwrap();

    let log = read(dir.join("experiment_log.txt"));
    assert_eq!(log.matches("No sweeps to be carried during this ramp.").count(), 2);
    assert_eq!(fs::read_dir(dir.join("1_up")).unwrap().count(), 0);
    assert!(analyser.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_ramp_is_rejected() {
    let root = TempDir::new().unwrap();
    let mut fast = spec(30.0, 60.0);
    fast.rate = 50.0;
    let result = ExperimentController::new(
        context(root.path(), Arc::new(SimulatedStage::new()), SimulatedAnalyser::new()),
        Ramp::sequence([fast]).unwrap(),
        "",
    );
    assert!(matches!(
        result,
        Err(VtiError::Configuration { ref fault }) if fault == "Rate"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_sampler_tracks_stage() {
    let root = TempDir::new().unwrap();
    let stage = Arc::new(SimulatedStage::new());
    let controller = ExperimentController::new(
        context(root.path(), stage.clone(), SimulatedAnalyser::new()),
        Ramp::sequence([spec(30.0, 40.0)]).unwrap(),
        "",
    )
    .unwrap();

    let handle = controller.start().unwrap();
    let mut state = handle.subscribe();
    state
        .wait_for(|s| s.stage_phase == Some(StagePhase::Holding))
        .await
        .unwrap();
    let sampled = handle.temperature().unwrap();
    let actual = stage.read_temperature().await.unwrap();
    assert!((sampled.temperature - actual).abs() <= 1.0);
    handle.cancel();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_sweep_keeps_partial_file() {
    let root = TempDir::new().unwrap();
    let stage = Arc::new(SimulatedStage::new());
    let controller = ExperimentController::new(
        context(root.path(), stage.clone(), SimulatedAnalyser::new()),
        Ramp::sequence([spec(30.0, 40.0)]).unwrap(),
        "",
    )
    .unwrap();

    let handle = controller.start().unwrap();
    let mut state = handle.subscribe();
    state.wait_for(|s| s.scan.is_some()).await.unwrap();
    handle.cancel();

    let dir = handle.dir().to_path_buf();
    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, ExperimentOutcome::Cancelled { .. }));

    // The point in flight finishes, nothing after it is taken
    let point_dir = dir.join("1_up").join("30C");
    let sweep = read(point_dir.join("30C_sweep_1.txt"));
    let rows = sweep.lines().count() - 2;
    assert!((1..4).contains(&rows), "expected a partial sweep, got {} rows", rows);
    assert!(!point_dir.join("30C_sweep_2.txt").exists());
    assert!(!dir.join("1_up").join("40C").exists());

    let details: serde_json::Value = serde_json::from_str(&read(dir.join("details.json"))).unwrap();
    assert_eq!(details["complete"], false);
    assert!(read(dir.join("experiment_log.txt")).contains("Stop requested / user interrupt."));
    assert!(!stage.is_heating());
}

#[tokio::test(start_paused = true)]
async fn test_stage_stop_failure_is_logged_and_reported() {
    let root = TempDir::new().unwrap();
    let mut once = spec(30.0, 30.0);
    once.num_sweeps_at_temperature = 1;
    let controller = ExperimentController::new(
        ExperimentContext {
            stage: Arc::new(StuckStage(SimulatedStage::new())),
            analyser: Arc::new(SimulatedAnalyser::new().with_overhead(0.5)),
            recorder: TelemetryRecorder::create(root.path(), "stuck").unwrap(),
            timing: ExperimentTiming::default(),
        },
        Ramp::sequence([once]).unwrap(),
        "",
    )
    .unwrap();

    let handle = controller.start().unwrap();
    let state = handle.subscribe();
    let dir = handle.dir().to_path_buf();
    let err = handle.join().await.unwrap_err();

    assert!(matches!(err, VtiError::Hardware(ref m) if m.contains("stage comms lost")));
    let log = read(dir.join("experiment_log.txt"));
    assert!(log.contains("Could not stop stage: Hardware error: stage comms lost"));
    assert!(log.contains("Experiment Complete"));
    assert!(
        dir.join("temp_profile.png").exists() || log.contains("Temperature profile plot failed"),
        "wrap-up must still run"
    );
    assert_eq!(state.borrow().phase, RunPhase::Terminal);

    let details: serde_json::Value = serde_json::from_str(&read(dir.join("details.json"))).unwrap();
    assert!(details["time_elapsed"].is_string());
}
