// lifecycle.rs: Per-call state machine and the scoped-execution wrapper.
//
//   Running ──error──▶ Failed ──▶ Cleanup ──▶ Done
//      │                            ▲
//      └────────── success ─────────┘
//
// Cleanup is unconditional: whatever happened in Running, every buffer the
// call registered in its `DeviceScope` is released before Done, and the
// status recorded at the first failure is the one returned.

use log::{debug, error};

use crate::accel::Accelerator;
use crate::buffer::DeviceScope;
use crate::error::{ConvError, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Failed,
    Cleanup,
    Done,
}

impl Phase {
    fn can_enter(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Running, Phase::Failed)
                | (Phase::Running, Phase::Cleanup)
                | (Phase::Failed, Phase::Cleanup)
                | (Phase::Cleanup, Phase::Done)
        )
    }
}

/// Phase history and terminal status of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    history: Vec<Phase>,
    status: Status,
    /// Buffers freed during Cleanup.
    released: usize,
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle { history: vec![Phase::Running], status: Status::Success, released: 0 }
    }

    pub fn phase(&self) -> Phase {
        self.history.last().copied().unwrap_or(Phase::Running)
    }

    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn released(&self) -> usize {
        self.released
    }

    fn enter(&mut self, next: Phase) {
        let current = self.phase();
        debug_assert!(current.can_enter(next), "illegal transition {current:?} → {next:?}");
        debug!("lifecycle {current:?} → {next:?}");
        self.history.push(next);
    }

    /// Record the first failure. Later failures are ignored.
    pub fn fail(&mut self, err: &ConvError) {
        if self.phase() != Phase::Running {
            return;
        }
        error!("call failed ({}): {err}", err.status());
        self.status = err.status();
        self.enter(Phase::Failed);
    }

    pub fn enter_cleanup(&mut self) {
        self.enter(Phase::Cleanup);
    }

    /// Leave Cleanup, returning the terminal status.
    pub fn finish(&mut self, released: usize) -> Status {
        self.released = released;
        self.enter(Phase::Done);
        self.status
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `body` with a fresh device scope, then release the scope whatever the
/// outcome. Returns the body's result together with the finished lifecycle.
pub fn run_scoped<A, T, F>(accel: &A, body: F) -> (Result<T, ConvError>, Lifecycle)
where
    A: Accelerator,
    F: FnOnce(&mut DeviceScope<'_, A>) -> Result<T, ConvError>,
{
    let mut lifecycle = Lifecycle::new();
    let mut scope = DeviceScope::new(accel);

    let result = body(&mut scope);
    if let Err(e) = &result {
        lifecycle.fail(e);
    }

    lifecycle.enter_cleanup();
    let released = scope.release_all();
    let status = lifecycle.finish(released);
    debug!("call done: {status} ({released} buffers released)");
    (result, lifecycle)
}
