//! Custom error types for the application.
//!
//! This module defines the primary error type, `VtiError`, for the experiment engine.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure a variable-temperature run can hit.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidRamp`**: A ramp whose parameters cannot be expanded into set-points and
//!   frequencies (non-dividing interval, zero rate, bad frequency range).
//! - **`Configuration`**: A ramp or setting that parses but falls outside the device
//!   limits. Carries the short fault name shown to the operator (e.g. `"Start Temp"`).
//! - **`Settings`**: Wraps `figment` errors raised while loading `vti.toml`.
//! - **`Io`** / **`Json`**: Persistence failures on the experiment directory.
//! - **`Hardware`**: Stage or analyser communication failures. Always fatal for the run.
//! - **`MalformedReading`**: A single analyser response that could not be interpreted.
//!   Recovered locally by the sweep retry policy.
//! - **`SweepAborted`**: The second consecutive failure at one frequency.
//!
//! Driver code talks `anyhow::Result` at the capability seams; the controllers convert
//! those into `Hardware` with [`VtiError::hardware`] so that the context chain survives.

use crate::planner::InvalidRampError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, VtiError>;

#[derive(Error, Debug)]
pub enum VtiError {
    #[error("Invalid ramp: {0}")]
    InvalidRamp(#[from] InvalidRampError),

    #[error("Configuration validation error: {fault}")]
    Configuration { fault: String },

    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Malformed reading at {frequency} Hz: {reason}")]
    MalformedReading { frequency: f64, reason: String },

    #[error("Sweep aborted at {frequency} Hz after probe and retry: {reason}")]
    SweepAborted { frequency: f64, reason: String },

    #[error("Plot rendering failed: {0}")]
    Plot(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl VtiError {
    /// Wraps a driver-level error as a fatal hardware error, keeping its context chain.
    pub fn hardware(err: anyhow::Error) -> Self {
        VtiError::Hardware(format!("{:#}", err))
    }

    /// Builds a configuration error from an operator-facing fault name.
    pub fn fault(fault: impl Into<String>) -> Self {
        VtiError::Configuration {
            fault: fault.into(),
        }
    }
}

impl From<figment::Error> for VtiError {
    fn from(err: figment::Error) -> Self {
        VtiError::Settings(Box::new(err))
    }
}
