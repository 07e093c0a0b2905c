//! Debugger session state machine.
//!
//! Hierarchy:
//! ```text
//! Detached ←→ Attached (superstate)
//!                 ├── Running
//!                 ├── Paused { reason }
//!                 ├── Stepping     [step / stepOut issued]
//!                 └── Continuing   [continue issued]
//! ```
//!
//! Continuation commands are only meaningful in `Paused`; anywhere else they
//! are a desync and leave the state unchanged.

use statig::prelude::*;
use tracing::debug;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum DebugEvent {
    Attach,
    /// The guest thread stopped at a hook.
    Break { reason: String },
    Step,
    StepOut,
    Continue,
    /// The guest thread picked up its continuation.
    Resumed,
    Detach,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DebugFlow {
    /// Number of pauses since attach.
    pub pauses: u64,
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::detached()",
    state(derive(Debug, Clone, PartialEq))
)]
impl DebugFlow {
    #[state]
    fn detached(&mut self, event: &DebugEvent) -> Outcome<State> {
        match event {
            DebugEvent::Attach => {
                self.pauses = 0;
                Transition(State::running())
            }
            _ => Handled,
        }
    }

    #[superstate]
    fn attached(&mut self, event: &DebugEvent) -> Outcome<State> {
        match event {
            DebugEvent::Detach => Transition(State::detached()),
            other => {
                debug!(event = ?other, "debug event ignored in current state");
                Handled
            }
        }
    }

    #[state(superstate = "attached")]
    fn running(&mut self, event: &DebugEvent) -> Outcome<State> {
        match event {
            DebugEvent::Break { reason } => {
                self.pauses += 1;
                Transition(State::paused(reason.clone()))
            }
            _ => Super,
        }
    }

    #[state(superstate = "attached")]
    fn paused(&mut self, event: &DebugEvent, reason: &String) -> Outcome<State> {
        let _ = reason;
        match event {
            DebugEvent::Step | DebugEvent::StepOut => Transition(State::stepping()),
            DebugEvent::Continue => Transition(State::continuing()),
            _ => Super,
        }
    }

    #[state(superstate = "attached")]
    fn stepping(&mut self, event: &DebugEvent) -> Outcome<State> {
        match event {
            DebugEvent::Resumed => Transition(State::running()),
            _ => Super,
        }
    }

    #[state(superstate = "attached")]
    fn continuing(&mut self, event: &DebugEvent) -> Outcome<State> {
        match event {
            DebugEvent::Resumed => Transition(State::running()),
            _ => Super,
        }
    }
}

impl State {
    /// Short name reported by the debugger's `status` command.
    pub fn label(&self) -> &'static str {
        match self {
            State::Detached { .. } => "detached",
            State::Running { .. } => "running",
            State::Paused { .. } => "paused",
            State::Stepping { .. } => "stepping",
            State::Continuing { .. } => "continuing",
        }
    }
}
