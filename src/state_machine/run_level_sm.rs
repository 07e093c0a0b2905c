//! Computer lifecycle state machine.
//!
//! ```text
//! Initializing ──Booted──► Running ──Stop──► Terminating ──TornDown──► Destroyed
//!      ▲  │                   │
//!      │  └──Stop─► Terminating
//!      │                      └──Reboot──► RebootRequested ──TornDown──► Destroyed
//!      └────────────Restart───────────────────────┘
//! ```
//!
//! The externally observable run level (`Stopped`, `Running`, `Rebooting`)
//! lives in an atomic on the computer; this machine tracks the finer-grained
//! phase on the computer's own thread.

use statig::prelude::*;
use tracing::{debug, info};

use crate::computer::ComputerId;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The engine loaded the boot script.
    Booted,
    /// Run level dropped to Stopped, or boot failed.
    Stop,
    /// Run level switched to Rebooting.
    Reboot,
    /// Engine torn down for a reboot; start over.
    Restart,
    /// Thread is about to exit.
    TornDown,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

pub struct Lifecycle {
    pub computer: ComputerId,
    pub boots: u32,
}

impl Lifecycle {
    pub fn new(computer: ComputerId) -> Self {
        Self { computer, boots: 0 }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::initializing()",
    state(derive(Debug, Clone, PartialEq))
)]
impl Lifecycle {
    #[state]
    fn initializing(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Booted => {
                self.boots += 1;
                Transition(State::running())
            }
            LifecycleEvent::Stop => Transition(State::terminating()),
            _ => Handled,
        }
    }

    #[state(entry_action = "enter_running")]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Stop => Transition(State::terminating()),
            LifecycleEvent::Reboot => Transition(State::reboot_requested()),
            _ => Handled,
        }
    }

    #[state]
    fn terminating(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::TornDown => Transition(State::destroyed()),
            _ => Handled,
        }
    }

    #[state]
    fn reboot_requested(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Restart => Transition(State::initializing()),
            LifecycleEvent::TornDown => Transition(State::destroyed()),
            _ => Handled,
        }
    }

    #[state(entry_action = "enter_destroyed")]
    fn destroyed(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        debug!(computer = self.computer, ?event, "event after teardown ignored");
        Handled
    }

    #[action]
    fn enter_running(&mut self) {
        info!(computer = self.computer, boot = self.boots, "computer running");
    }

    #[action]
    fn enter_destroyed(&mut self) {
        info!(computer = self.computer, "computer destroyed");
    }
}
