//! Status events and cooperative cancellation.
//!
//! Every state entry in the stage and sweep state machines emits a [`StatusEvent`]
//! through a [`StatusSink`]. The `first` flag is true only for the first emission of a
//! state for the current set-point, so the experiment log gets one line per transition
//! while live observers still see every countdown tick.

use crate::error::AppResult;
use crate::stage::StagePhase;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// What a status event refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusKind {
    /// Experiment start, completion and interruption.
    Lifecycle,
    /// Entry into (or a tick of) a stage phase.
    Stage(StagePhase),
    /// The stage reported holding outside the coarse band `attempts` times.
    ReachRetry { attempts: u32 },
    /// Countdown between consecutive sweeps.
    SweepDelay,
    /// Sweep start and end.
    Sweep,
    /// Progress within a sweep.
    Scan {
        index: usize,
        total: usize,
        frequency: f64,
    },
    /// A recoverable problem.
    Warning,
    /// A fatal problem, emitted before the run terminates.
    Error,
}

/// One status update.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub message: String,
    pub first: bool,
}

impl StatusEvent {
    pub fn new(kind: StatusKind, message: impl Into<String>, first: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            first,
        }
    }

    /// An event that is always written to the log.
    pub fn logged(kind: StatusKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, true)
    }
}

/// Receiver of status events.
///
/// Implementations must not block; a failing sink is fatal to the run because the
/// experiment log would otherwise stop being a complete history.
pub trait StatusSink: Send + Sync {
    fn emit(&self, event: StatusEvent) -> AppResult<()>;
}

/// Shared cancellation flag, checked at every poll boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Messages of the events that would reach the experiment log.
    pub fn logged_messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.first)
            .map(|e| e.message)
            .collect()
    }
}

impl StatusSink for RecordingSink {
    fn emit(&self, event: StatusEvent) -> AppResult<()> {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn recording_sink_filters_repeats() {
        let sink = RecordingSink::new();
        sink.emit(StatusEvent::logged(StatusKind::SweepDelay, "t = 3s"))
            .unwrap();
        sink.emit(StatusEvent::new(StatusKind::SweepDelay, "t = 2s", false))
            .unwrap();
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.logged_messages(), vec!["t = 3s".to_string()]);
    }
}
