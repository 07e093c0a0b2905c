//! Runaway-guest detection.
//!
//! Two layers over the engine's hooks:
//!
//! ```text
//!  count hook (computer thread)        watchdog task (tokio runtime)
//!  ───────────────────────────         ─────────────────────────────
//!  elapsed since last event            sleeps abort_timeout after each
//!  > timeout → Raise("Too long         delivery, then ticks every second:
//!  without yielding")                  strike += 1, force a re-check;
//!                                      at 5 strikes escalate:
//!                                        strict      → kill
//!                                        interactive → ask UI (restart | wait)
//! ```
//!
//! The watchdog holds only a weak [`ComputerHandle`] and an arm serial, so a
//! timer that outlives its computer or its arming is a no-op.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::computer::{ComputerHandle, ComputerShared, HostUi, NotResponding, RunLevel};
use crate::dispatcher::TaskDispatcher;
use crate::engine::HookAction;

/// Error raised inside the guest when it hogs the thread.
pub const TOO_LONG: &str = "Too long without yielding";

const STRIKES_TO_ESCALATE: i32 = 5;
/// Strike count after the user chose to keep waiting.
const WAIT_GRACE: i32 = -15;
const TICK: Duration = Duration::from_secs(1);
/// Deliveries closer together than this do not re-arm the watchdog.
const REARM_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorSettings {
    pub abort_timeout: Duration,
    /// Kill instead of asking.
    pub strict: bool,
    pub hook_interval: u32,
}

/// Outcome of one watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Guest is back in the event loop; the watchdog can stop.
    Idle,
    /// Still running; keep ticking.
    Pending,
    Escalate,
}

struct GovernorState {
    last_event: Instant,
    raised: bool,
    strikes: i32,
    asking: bool,
    last_arm: Option<Instant>,
    watchdog: Option<JoinHandle<()>>,
}

/// Per-computer enforcement state.
pub struct ResourceGovernor {
    settings: GovernorSettings,
    runtime: tokio::runtime::Handle,
    dispatcher: Arc<TaskDispatcher>,
    ui: Arc<dyn HostUi>,
    getting_event: AtomicBool,
    suspended: AtomicBool,
    kill: AtomicBool,
    force_check: AtomicBool,
    arm_serial: AtomicU64,
    state: Mutex<GovernorState>,
}

impl ResourceGovernor {
    pub fn new(
        settings: GovernorSettings,
        runtime: tokio::runtime::Handle,
        dispatcher: Arc<TaskDispatcher>,
        ui: Arc<dyn HostUi>,
    ) -> Self {
        Self {
            settings,
            runtime,
            dispatcher,
            ui,
            getting_event: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            kill: AtomicBool::new(false),
            force_check: AtomicBool::new(false),
            arm_serial: AtomicU64::new(0),
            state: Mutex::new(GovernorState {
                last_event: Instant::now(),
                raised: false,
                strikes: 0,
                asking: false,
                last_arm: None,
                watchdog: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> GovernorSettings {
        self.settings
    }

    pub fn hook_interval(&self) -> u32 {
        self.settings.hook_interval
    }

    /// Clear all flags for a fresh boot.
    pub fn reset(&self, now: Instant) {
        self.kill.store(false, Ordering::SeqCst);
        self.force_check.store(false, Ordering::SeqCst);
        self.getting_event.store(false, Ordering::SeqCst);
        self.suspended.store(false, Ordering::SeqCst);
        let mut st = self.lock();
        st.last_event = now;
        st.raised = false;
        st.strikes = 0;
        st.asking = false;
    }

    pub fn kill_requested(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }

    pub(crate) fn request_kill(&self) {
        self.kill.store(true, Ordering::SeqCst);
    }

    pub fn is_getting_event(&self) -> bool {
        self.getting_event.load(Ordering::SeqCst)
    }

    pub fn strikes(&self) -> i32 {
        self.lock().strikes
    }

    /// The computer thread is about to block for an event.
    pub fn enter_wait(&self) {
        self.getting_event.store(true, Ordering::SeqCst);
    }

    /// The computer thread left `next_event`. On delivery the clock resets
    /// and the watchdog is re-armed.
    pub fn leave_wait(&self, handle: &ComputerHandle, delivered: bool, now: Instant) {
        self.getting_event.store(false, Ordering::SeqCst);
        if !delivered {
            return;
        }
        self.touch(now);
        let rearm = self
            .lock()
            .last_arm
            .is_none_or(|last| now.duration_since(last) > REARM_DEBOUNCE);
        if rearm {
            self.arm(handle.clone(), now);
        }
    }

    /// Reset the no-yield clock.
    pub fn touch(&self, now: Instant) {
        self.force_check.store(false, Ordering::SeqCst);
        let mut st = self.lock();
        st.last_event = now;
        st.raised = false;
        st.strikes = 0;
    }

    /// The debugger holds the thread; no enforcement until `resume`.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self, now: Instant) {
        self.suspended.store(false, Ordering::SeqCst);
        self.touch(now);
    }

    /// Instruction-count hook check.
    pub fn on_count(&self, now: Instant) -> HookAction {
        if self.kill_requested() {
            return HookAction::Abort;
        }
        if self.is_getting_event() || self.suspended.load(Ordering::SeqCst) {
            return HookAction::Continue;
        }
        let mut st = self.lock();
        if now.duration_since(st.last_event) <= self.settings.abort_timeout {
            return HookAction::Continue;
        }
        if !st.raised || self.force_check.swap(false, Ordering::SeqCst) {
            st.raised = true;
            debug!(strikes = st.strikes, "raising no-yield error");
            return HookAction::Raise(TOO_LONG.to_string());
        }
        HookAction::Continue
    }

    /// Start (or restart) the wall-clock watchdog.
    pub fn arm(&self, handle: ComputerHandle, now: Instant) {
        let serial = self.arm_serial.fetch_add(1, Ordering::SeqCst) + 1;
        let timeout = self.settings.abort_timeout;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            loop {
                let Some(shared) = handle.upgrade() else {
                    return;
                };
                if shared.governor.arm_serial.load(Ordering::SeqCst) != serial {
                    return;
                }
                match shared.governor.tick() {
                    Tick::Idle => return,
                    Tick::Pending => {}
                    Tick::Escalate => escalate(&shared, &handle),
                }
                drop(shared);
                tokio::time::sleep(TICK).await;
            }
        });
        let mut st = self.lock();
        st.last_arm = Some(now);
        if let Some(old) = st.watchdog.replace(task) {
            old.abort();
        }
    }

    /// Cancel the watchdog. A tick already in flight sees a stale serial.
    pub fn disarm(&self) {
        self.arm_serial.fetch_add(1, Ordering::SeqCst);
        let mut st = self.lock();
        st.last_arm = None;
        if let Some(task) = st.watchdog.take() {
            task.abort();
        }
    }

    /// One watchdog period elapsed without the guest yielding.
    pub fn tick(&self) -> Tick {
        if self.is_getting_event() {
            return Tick::Idle;
        }
        if self.suspended.load(Ordering::SeqCst) {
            return Tick::Pending;
        }
        let mut st = self.lock();
        st.strikes += 1;
        self.force_check.store(true, Ordering::SeqCst);
        if st.strikes >= STRIKES_TO_ESCALATE && !st.asking {
            if !self.settings.strict {
                st.asking = true;
            }
            return Tick::Escalate;
        }
        Tick::Pending
    }

    /// The user chose to keep waiting.
    pub fn grant_grace(&self) {
        let mut st = self.lock();
        st.strikes = WAIT_GRACE;
        st.asking = false;
    }

    fn finish_asking(&self) {
        self.lock().asking = false;
    }
}

impl Drop for ResourceGovernor {
    fn drop(&mut self) {
        if let Some(task) = self.lock().watchdog.take() {
            task.abort();
        }
    }
}

fn escalate(shared: &ComputerShared, handle: &ComputerHandle) {
    let id = shared.id();
    if shared.governor.settings.strict {
        warn!(computer = id, "{TOO_LONG}; killing computer");
        shared.display_failure(TOO_LONG);
        shared.governor.request_kill();
        shared.set_run_level(RunLevel::Stopped);
        return;
    }

    info!(computer = id, "computer not responding; asking the user");
    let ui = Arc::clone(&shared.governor.ui);
    let handle = handle.clone();
    shared.governor.dispatcher.submit_async(move || {
        let choice = ui.not_responding(id);
        let Some(shared) = handle.upgrade() else {
            return Ok(());
        };
        match choice {
            NotResponding::Restart => {
                info!(computer = id, "restarting unresponsive computer");
                shared.governor.request_kill();
                shared.governor.finish_asking();
                shared.set_run_level(RunLevel::Rebooting);
            }
            NotResponding::Wait => shared.governor.grant_grace(),
        }
        Ok(())
    });
}
