//! Generation-counted handles and the live-computer registry.
//!
//! Timers, remote sessions and the debugger reach a computer only through a
//! [`ComputerHandle`]. A handle upgrades only while the computer's thread is
//! alive and its generation matches, so a callback that outlives teardown
//! sees `None` instead of a stale computer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use super::{ComputerId, ComputerShared, RunLevel};
use crate::debug::Breakpoint;
use crate::event::{Event, EventProvider, Inbound, ready};
use crate::router::PlatformEvent;
use crate::screen::{Screen, WindowId};
use crate::vfs::{MountInfo, SandboxFs};

/// Set once the computer thread has fully exited.
#[derive(Debug, Default)]
pub(crate) struct ExitSignal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl ExitSignal {
    pub(crate) fn signal(&self) {
        *self.done.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        match timeout {
            None => *self
                .cv
                .wait_while(done, |d| !*d)
                .unwrap_or_else(|e| e.into_inner()),
            Some(t) => *self
                .cv
                .wait_timeout_while(done, t, |d| !*d)
                .unwrap_or_else(|e| e.into_inner())
                .0,
        }
    }
}

/// Weak, generation-checked reference to a computer.
#[derive(Clone)]
pub struct ComputerHandle {
    id: ComputerId,
    generation: u64,
    inner: Weak<ComputerShared>,
    exited: Arc<ExitSignal>,
}

impl std::fmt::Debug for ComputerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputerHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ComputerHandle {
    pub(crate) fn new(shared: &Arc<ComputerShared>) -> Self {
        Self {
            id: shared.id(),
            generation: shared.generation(),
            inner: Arc::downgrade(shared),
            exited: Arc::clone(&shared.exited),
        }
    }

    pub fn id(&self) -> ComputerId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn upgrade(&self) -> Option<Arc<ComputerShared>> {
        let shared = self.inner.upgrade()?;
        (shared.is_alive() && shared.generation() == self.generation).then_some(shared)
    }

    pub fn is_alive(&self) -> bool {
        self.upgrade().is_some()
    }

    /// Queue a deferred event. Returns `false` if the computer is gone.
    pub fn queue_event(&self, provider: EventProvider) -> bool {
        match self.upgrade() {
            Some(shared) => shared.inbox().push(Inbound::Provider(provider)),
            None => {
                debug!(computer = self.id, "event queued for a destroyed computer; dropped");
                false
            }
        }
    }

    pub fn queue_named(&self, event: Event) -> bool {
        self.queue_event(ready(event))
    }

    /// Queue raw input for translation on the computer's thread.
    pub fn push_platform(&self, event: PlatformEvent) -> bool {
        self.upgrade()
            .is_some_and(|shared| shared.inbox().push(Inbound::Platform(event)))
    }

    pub fn shutdown(&self) -> bool {
        self.set_run_level(RunLevel::Stopped)
    }

    pub fn reboot(&self) -> bool {
        self.set_run_level(RunLevel::Rebooting)
    }

    fn set_run_level(&self, level: RunLevel) -> bool {
        match self.upgrade() {
            Some(shared) => {
                shared.set_run_level(level);
                true
            }
            None => false,
        }
    }

    pub fn run_level(&self) -> Option<RunLevel> {
        self.upgrade().map(|s| s.run_level())
    }

    pub fn window(&self) -> Option<WindowId> {
        self.upgrade().map(|s| s.window())
    }

    pub fn screen(&self) -> Option<Arc<Screen>> {
        self.upgrade().map(|s| Arc::clone(s.screen()))
    }

    pub fn fs(&self) -> Option<SandboxFs> {
        self.upgrade().map(|s| s.fs().clone())
    }

    pub fn mounts(&self) -> Option<Vec<MountInfo>> {
        self.upgrade().map(|s| s.fs().mounts().list())
    }

    pub fn breakpoints(&self) -> Option<Vec<Breakpoint>> {
        self.upgrade().map(|s| s.breakpoints().list())
    }

    /// Block until the computer thread exits, or `timeout` passes.
    /// Returns whether it exited.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        self.exited.wait(timeout)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Strong owner of every live computer, plus their thread handles.
#[derive(Default)]
pub struct ComputerRegistry {
    next_generation: AtomicU64,
    entries: Mutex<BTreeMap<ComputerId, Arc<ComputerShared>>>,
    threads: Mutex<Vec<(ComputerId, JoinHandle<()>)>>,
}

impl ComputerRegistry {
    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn insert(&self, shared: Arc<ComputerShared>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(&shared.id()).is_some_and(|s| s.is_alive()) {
            return false;
        }
        entries.insert(shared.id(), shared);
        true
    }

    pub(crate) fn attach_thread(&self, id: ComputerId, thread: JoinHandle<()>) {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.retain(|(_, t)| !t.is_finished());
        threads.push((id, thread));
    }

    /// Drop the registry's strong reference, if it still belongs to
    /// `generation`.
    pub(crate) fn remove(&self, id: ComputerId, generation: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(&id).is_some_and(|s| s.generation() == generation) {
            entries.remove(&id);
        }
    }

    pub fn contains(&self, id: ComputerId) -> bool {
        self.find(id).is_some()
    }

    pub fn find(&self, id: ComputerId) -> Option<ComputerHandle> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .filter(|s| s.is_alive())
            .map(ComputerHandle::new)
    }

    pub fn live(&self) -> Vec<ComputerHandle> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.is_alive())
            .map(ComputerHandle::new)
            .collect()
    }

    /// Computers drawing into `window`, either as their terminal or as an
    /// attached monitor.
    pub fn by_window(&self, window: WindowId) -> Vec<ComputerHandle> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.is_alive() && s.owns_window(window))
            .map(ComputerHandle::new)
            .collect()
    }

    /// Lowest id with no live computer.
    pub fn next_free_id(&self) -> ComputerId {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        (0..)
            .find(|id| !entries.get(id).is_some_and(|s| s.is_alive()))
            .unwrap_or(ComputerId::MAX)
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join every computer thread started so far.
    pub fn join_all(&self) {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for (id, thread) in threads {
            if thread.join().is_err() {
                warn!(computer = id, "computer thread panicked");
            }
        }
    }
}
