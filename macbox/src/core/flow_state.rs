//! Halt/continue policy for a single flow run.
//!
//! `FlowProgress` owns no step data; the engine feeds it one outcome per
//! executed step and asks which step comes next.

/// Where a flow run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Ready,
    /// Index of the next step to execute.
    Running(usize),
    Completed { ok: bool },
}

/// What the engine should do after recording a step outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Next,
    /// The step failed without `continueOnError`; remaining steps are abandoned.
    Halt,
    Done,
}

#[derive(Debug, Clone)]
pub struct FlowProgress {
    total: usize,
    next: usize,
    started: bool,
    saw_failure: bool,
    halted: bool,
}

impl FlowProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            next: 0,
            started: false,
            saw_failure: false,
            halted: false,
        }
    }

    pub fn state(&self) -> FlowState {
        if self.halted || (self.started && self.next >= self.total) {
            return FlowState::Completed {
                ok: !self.saw_failure,
            };
        }
        if !self.started {
            return FlowState::Ready;
        }
        FlowState::Running(self.next)
    }

    /// Index of the step to run next, or `None` once the run is complete.
    pub fn next_index(&mut self) -> Option<usize> {
        self.started = true;
        match self.state() {
            FlowState::Running(index) => Some(index),
            _ => None,
        }
    }

    /// Record the outcome of the step returned by the last `next_index` call.
    pub fn record(&mut self, failed: bool, continue_on_error: bool) -> Advance {
        self.next += 1;
        if failed {
            self.saw_failure = true;
            if !continue_on_error {
                self.halted = true;
                return Advance::Halt;
            }
        }
        if self.next >= self.total {
            Advance::Done
        } else {
            Advance::Next
        }
    }

    pub fn ok(&self) -> bool {
        !self.saw_failure
    }
}
