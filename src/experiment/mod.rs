//! Experiment orchestration.
//!
//! - `controller`: the run loop and the [`ExperimentHandle`] used to observe and stop it
//! - `sampler`: the 1 Hz temperature logger running beside the control task
//! - `state`: snapshots published to observers
//!
//! # Example
//!
//! ```rust,ignore
//! let context = ExperimentContext {
//!     stage: Arc::new(SimulatedStage::new()),
//!     analyser: Arc::new(SimulatedAnalyser::new()),
//!     recorder: TelemetryRecorder::create(Path::new("experiments"), "demo")?,
//!     timing: ExperimentTiming::default(),
//! };
//! let handle = ExperimentController::new(context, ramps, "")?.start()?;
//! let mut state = handle.subscribe();
//! let outcome = handle.join().await?;
//! ```

pub mod controller;
pub mod sampler;
pub mod state;

pub use controller::{
    ExperimentContext, ExperimentController, ExperimentHandle, ExperimentOutcome, ExperimentTiming,
};
pub use sampler::TemperatureSampler;
pub use state::{ExperimentSnapshot, RunPhase, ScanProgress};
