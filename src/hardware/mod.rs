//! Stage and analyser implementations.
//!
//! - `simulated`: virtual stage and analyser on `tokio::time`
//! - `solartron`: Solartron 1260 over a command [`adapter::Adapter`]
//! - `biologic`: Biologic SP-200 behind an EC-Lab channel binding

pub mod adapter;
pub mod biologic;
pub mod simulated;
pub mod solartron;

pub use simulated::{SimulatedAnalyser, SimulatedStage};
pub use solartron::{Solartron1260, SolartronOptions};
