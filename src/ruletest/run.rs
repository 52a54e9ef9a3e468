//! Per-run state owned by the coordinator.

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, warn};
use uuid::Uuid;

use super::relay::StreamRelay;

/// Lifecycle of one rule test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Staged,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Staged)
                | (Idle, Failed)
                | (Staged, Running)
                | (Staged, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Staged => "staged",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One execution of a rule test.
#[derive(Debug)]
pub struct TestRun {
    pub id: Uuid,
    pub staged_path: Option<PathBuf>,
    pub args: Vec<String>,
    pub relay: StreamRelay,
    /// Set once the observer went away and the process was asked to stop.
    pub cancelled: bool,
    state: RunState,
}

impl TestRun {
    pub fn new(relay: StreamRelay) -> Self {
        Self {
            id: Uuid::new_v4(),
            staged_path: None,
            args: Vec::new(),
            relay,
            cancelled: false,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn transition(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            warn!(
                run_id = %self.id,
                from = %self.state,
                to = %next,
                "unexpected run state transition"
            );
            debug_assert!(false, "illegal transition {} -> {}", self.state, next);
        }
        debug!(run_id = %self.id, from = %self.state, to = %next, "run state");
        self.state = next;
    }
}
