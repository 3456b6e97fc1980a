//! Core library for the vti_daq experiment engine.
//!
//! Drives a variable-temperature impedance experiment: a hot stage is taken through
//! a list of set-points and at each one an impedance analyser runs one or more
//! frequency sweeps, while temperature and impedance data are written to disk as they
//! are produced. Stage and analyser are reached only through the
//! [`stage::TemperatureStage`] and [`analyser::ImpedanceAnalyser`] traits, so the
//! whole engine runs against the simulated devices in [`hardware::simulated`].

pub mod analyser;
pub mod config;
pub mod error;
pub mod estimate;
pub mod events;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod planner;
pub mod stage;
pub mod telemetry;

pub use error::{AppResult, VtiError};
pub use experiment::{
    ExperimentContext, ExperimentController, ExperimentHandle, ExperimentOutcome, ExperimentTiming,
};
pub use planner::{Direction, Ramp, RampSpec};
