//! Live experiment state published to observers.

use crate::stage::StagePhase;
use std::time::Duration;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    /// Cancellation requested, shutting down
    Stopping,
    /// All ramps done, shutting down
    Completing,
    Terminal,
}

/// Progress within the current sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanProgress {
    pub index: usize,
    pub total: usize,
    pub frequency: f64,
}

/// Snapshot of the run, written only by the control task.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExperimentSnapshot {
    pub phase: RunPhase,
    /// 1-based, 0 before the first ramp
    pub ramp: usize,
    pub num_ramps: usize,
    /// 1-based position in the ramp's measurement list
    pub point: usize,
    pub num_points: usize,
    pub set_point: Option<f64>,
    /// 1-based, 0 outside sweeps
    pub sweep: u32,
    pub num_sweeps: u32,
    pub stage_phase: Option<StagePhase>,
    pub scan: Option<ScanProgress>,
    /// Latest sampled cell temperature
    pub temperature: Option<f64>,
    pub elapsed: Duration,
    pub status: String,
    pub complete: bool,
    pub cancelled: bool,
}

impl ExperimentSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.phase == RunPhase::Terminal
    }
}
