//! Virtual computers and their event loops.
//!
//! ```text
//!  ComputerBuilder::start()
//!    └── thread "computer-N"
//!          loop {
//!            engine = factory.create()          ◄── fresh engine per boot
//!            engine.boot(script, api)
//!            loop { engine.resume(args) ─Yielded(filter)─► next_event(filter) }
//!            teardown (watchdog, timers)
//!            Rebooting? ─yes─► continue : break
//!          }
//! ```
//!
//! State other threads may touch lives in [`ComputerShared`] behind its own
//! locks and atomics; the [`Computer`] itself (engine, router, ready queue,
//! lifecycle machine) never leaves its thread.

pub mod context;
pub mod handle;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::mpsc::{SyncSender, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use statig::prelude::*;
use tracing::{debug, error, info, trace, warn};

pub use context::{HeadlessUi, HostContext, HostUi, MessageLevel, NotResponding, WindowAllocator};
pub use handle::{ComputerHandle, ComputerRegistry};

use crate::api::{self, Library};
use crate::debug::{BreakpointTable, DebugLink};
use crate::dispatcher::panic_message;
use crate::engine::{
    BootScript, EngineError, EngineFactory, EngineStatus, FrameAccess, GuestEngine, HookAction,
    HookEvent, HookSink,
};
use crate::event::{Event, Inbound, Inbox};
use crate::governor::{GovernorSettings, ResourceGovernor};
use crate::router::{EventRouter, Routed};
use crate::screen::{Screen, WindowId};
use crate::state_machine::run_level_sm::{Lifecycle, LifecycleEvent};
use crate::config::HostConfig;
use crate::vfs::{Backing, FsError, MountTable, SandboxFs, VirtualRegistry};
use handle::ExitSignal;

pub type ComputerId = u32;

/// Longest a blocked event loop sleeps before re-checking its run level.
const IDLE_WAKE: Duration = Duration::from_secs(5);

/// Externally observable run level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunLevel {
    Stopped = 0,
    Running = 1,
    Rebooting = 2,
}

impl RunLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunLevel::Running,
            2 => RunLevel::Rebooting,
            _ => RunLevel::Stopped,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComputerError {
    #[error(transparent)]
    Boot(#[from] EngineError),
    #[error("boot entry {name} could not be read: {reason}")]
    BootMissing { name: String, reason: String },
    #[error("computer {0} is already running")]
    AlreadyRunning(ComputerId),
    #[error("failed to prepare data directory for computer {id}")]
    DataDir {
        id: ComputerId,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to set up mounts for computer {id}")]
    Mount {
        id: ComputerId,
        #[source]
        source: FsError,
    },
    #[error("failed to spawn computer thread")]
    Spawn(#[source] std::io::Error),
    #[error("computer thread exited before it finished booting")]
    Vanished,
    #[error("computer thread panicked: {0}")]
    Panicked(String),
}

type BootSignal = SyncSender<Result<(), ComputerError>>;

/// Where the boot script comes from.
#[derive(Debug, Clone)]
pub enum BootEntry {
    /// A file on the host.
    Host(PathBuf),
    /// A path inside the computer's own filesystem.
    Guest(String),
    Embedded(BootScript),
}

impl Default for BootEntry {
    fn default() -> Self {
        BootEntry::Guest("rom/bios.lua".to_string())
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// The part of a computer other threads may reach through a handle.
pub struct ComputerShared {
    id: ComputerId,
    generation: u64,
    window: WindowId,
    run_level: AtomicU8,
    alive: AtomicBool,
    inbox: Inbox,
    fs: SandboxFs,
    breakpoints: Mutex<BreakpointTable>,
    screen: Arc<Screen>,
    monitors: Arc<Mutex<BTreeMap<WindowId, String>>>,
    pub(crate) governor: ResourceGovernor,
    debug: Mutex<Weak<DebugLink>>,
    runtime: tokio::runtime::Handle,
    timers: Mutex<HashMap<u32, tokio::task::JoinHandle<()>>>,
    next_timer: AtomicU32,
    booted: Mutex<(Instant, DateTime<Utc>)>,
    pub(crate) exited: Arc<ExitSignal>,
}

impl ComputerShared {
    pub fn id(&self) -> ComputerId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn run_level(&self) -> RunLevel {
        RunLevel::from_u8(self.run_level.load(Ordering::SeqCst))
    }

    /// Change the run level and wake the event loop to notice it.
    pub fn set_run_level(&self, level: RunLevel) {
        let old = self.run_level.swap(level as u8, Ordering::SeqCst);
        if old != level as u8 {
            debug!(computer = self.id, ?level, "run level changed");
        }
        self.inbox.poke();
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn fs(&self) -> &SandboxFs {
        &self.fs
    }

    pub fn breakpoints(&self) -> MutexGuard<'_, BreakpointTable> {
        self.breakpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn screen(&self) -> &Arc<Screen> {
        &self.screen
    }

    pub fn monitors(&self) -> &Arc<Mutex<BTreeMap<WindowId, String>>> {
        &self.monitors
    }

    pub fn owns_window(&self, window: WindowId) -> bool {
        window == self.window
            || self
                .monitors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&window)
    }

    /// Time since the current boot.
    pub fn uptime(&self) -> Duration {
        self.booted.lock().unwrap_or_else(|e| e.into_inner()).0.elapsed()
    }

    pub fn booted_at(&self) -> DateTime<Utc> {
        self.booted.lock().unwrap_or_else(|e| e.into_inner()).1
    }

    pub(crate) fn debug_link(&self) -> Option<Arc<DebugLink>> {
        self.debug.lock().unwrap_or_else(|e| e.into_inner()).upgrade()
    }

    pub(crate) fn set_debug_link(&self, link: Weak<DebugLink>) {
        *self.debug.lock().unwrap_or_else(|e| e.into_inner()) = link;
    }

    pub(crate) fn clear_debug_link(&self) {
        *self.debug.lock().unwrap_or_else(|e| e.into_inner()) = Weak::new();
    }

    /// Print a failure on the terminal the way the guest would see it.
    pub fn display_failure(&self, message: &str) {
        self.screen.update(|frame| {
            frame.text_fg = 0xE;
            frame.cursor.x = 0;
            frame.write(message.as_bytes());
            frame.cursor.x = 0;
            frame.cursor.y += 1;
            if frame.cursor.y >= frame.height as i32 {
                frame.scroll(1);
                frame.cursor.y = frame.height as i32 - 1;
            }
        });
    }

    /// Queue a `timer` event after `delay`. Returns the timer id.
    pub fn start_timer(&self, handle: ComputerHandle, delay: Duration) -> u32 {
        let id = self.next_timer.fetch_add(1, Ordering::SeqCst);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = handle.upgrade() {
                shared
                    .timers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
            }
            handle.queue_named(Event::new("timer", vec![id.into()]));
        });
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, task);
        id
    }

    pub fn cancel_timer(&self, id: u32) -> bool {
        match self.timers.lock().unwrap_or_else(|e| e.into_inner()).remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn cancel_all_timers(&self) {
        let timers = std::mem::take(&mut *self.timers.lock().unwrap_or_else(|e| e.into_inner()));
        if !timers.is_empty() {
            debug!(computer = self.id, count = timers.len(), "cancelling timers");
        }
        for task in timers.into_values() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Build computer `id`'s mount table: the private root, `rom`, then
/// `system` mounts, then the configured mounts in order.
///
/// Configured mounts that fail are logged and skipped.
pub fn mount_table(
    config: &HostConfig,
    images: &VirtualRegistry,
    id: ComputerId,
    system: &[(String, Backing, bool)],
) -> Result<MountTable, ComputerError> {
    let root = config.computer_dir(id);
    std::fs::create_dir_all(&root).map_err(|source| ComputerError::DataDir { id, source })?;

    let mut table = MountTable::new(root);
    if let Some(rom) = &config.rom_dir {
        table
            .add_system("rom", Backing::Real(rom.clone()), config.rom_read_only, images)
            .map_err(|source| ComputerError::Mount { id, source })?;
    }
    for (at, backing, read_only) in system {
        table
            .add_system(at, backing.clone(), *read_only, images)
            .map_err(|source| ComputerError::Mount { id, source })?;
    }
    for spec in &config.mounts {
        let Ok(backing) = spec.backing.parse::<Backing>();
        if let Err(e) = table.add(&spec.comp_path, backing, spec.read_only, images) {
            warn!(computer = id, mount = %spec.comp_path, error = %e, "skipping configured mount");
        }
    }
    Ok(table)
}

pub struct ComputerBuilder {
    ctx: HostContext,
    id: ComputerId,
    engines: Option<Arc<dyn EngineFactory>>,
    boot: BootEntry,
    libraries: Vec<Library>,
    system_mounts: Vec<(String, Backing, bool)>,
}

impl ComputerBuilder {
    pub fn new(ctx: HostContext, id: ComputerId) -> Self {
        Self {
            ctx,
            id,
            engines: None,
            boot: BootEntry::default(),
            libraries: Vec::new(),
            system_mounts: Vec::new(),
        }
    }

    pub fn engine(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.engines = Some(factory);
        self
    }

    pub fn boot(mut self, entry: BootEntry) -> Self {
        self.boot = entry;
        self
    }

    /// Install an extra guest library on every boot.
    pub fn library(mut self, library: Library) -> Self {
        self.libraries.push(library);
        self
    }

    /// A mount the guest cannot remove.
    pub fn system_mount(mut self, at: &str, backing: Backing, read_only: bool) -> Self {
        self.system_mounts.push((at.to_string(), backing, read_only));
        self
    }

    /// Assemble the computer without starting its thread.
    ///
    /// The caller's thread becomes the computer's thread; `next_event` and
    /// `run` may be driven directly.
    pub fn build(self) -> Result<Computer, ComputerError> {
        if self.ctx.computers.contains(self.id) {
            return Err(ComputerError::AlreadyRunning(self.id));
        }
        let table = mount_table(&self.ctx.config, &self.ctx.images, self.id, &self.system_mounts)?;
        let ctx = self.ctx;
        let id = self.id;
        let config = &ctx.config;

        let window = ctx.windows.allocate();
        let screen = Arc::new(Screen::new(window, config.default_width, config.default_height));
        let monitors = Arc::new(Mutex::new(BTreeMap::new()));
        let fs = SandboxFs::new(Arc::new(Mutex::new(table)), Arc::clone(&ctx.images));
        let governor = ResourceGovernor::new(
            GovernorSettings {
                abort_timeout: config.abort_timeout(),
                strict: config.standards_mode,
                hook_interval: config.hook_interval.max(1),
            },
            ctx.runtime.clone(),
            Arc::clone(&ctx.dispatcher),
            Arc::clone(&ctx.ui),
        );

        let shared = Arc::new(ComputerShared {
            id,
            generation: ctx.computers.next_generation(),
            window,
            run_level: AtomicU8::new(RunLevel::Running as u8),
            alive: AtomicBool::new(true),
            inbox: Inbox::default(),
            fs: fs.clone(),
            breakpoints: Mutex::new(BreakpointTable::default()),
            screen: Arc::clone(&screen),
            monitors: Arc::clone(&monitors),
            governor,
            debug: Mutex::new(Weak::new()),
            runtime: ctx.runtime.clone(),
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU32::new(0),
            booted: Mutex::new((Instant::now(), Utc::now())),
            exited: Arc::new(ExitSignal::default()),
        });
        if !ctx.computers.insert(Arc::clone(&shared)) {
            ctx.windows.release(window);
            return Err(ComputerError::AlreadyRunning(id));
        }

        let router = EventRouter::new(
            id,
            window,
            monitors,
            screen,
            fs,
            Arc::clone(&ctx.handlers),
            config.router_options(),
        );
        let engines = self.engines.unwrap_or_else(|| Arc::new(NullEngineFactory));
        info!(computer = id, window, "computer created");

        Ok(Computer {
            handle: ComputerHandle::new(&shared),
            shared,
            ctx,
            router,
            ready: VecDeque::new(),
            lifecycle: Lifecycle::new(id).state_machine(),
            engines,
            boot: self.boot,
            libraries: self.libraries,
        })
    }

    /// Spawn the computer's thread and wait until it has booted.
    pub fn start(self) -> Result<ComputerHandle, ComputerError> {
        let computer = self.build()?;
        let handle = computer.handle();
        let registry = Arc::clone(&computer.ctx.computers);
        let (tx, rx) = sync_channel(1);
        let thread = std::thread::Builder::new()
            .name(format!("computer-{}", handle.id()))
            .spawn(move || computer.run_with_signal(Some(tx)))
            .map_err(|e| {
                registry.remove(handle.id(), handle.generation());
                ComputerError::Spawn(e)
            })?;
        registry.attach_thread(handle.id(), thread);
        rx.recv().map_err(|_| ComputerError::Vanished)??;
        Ok(handle)
    }
}

/// Used when no engine is configured: every boot fails to load.
struct NullEngineFactory;

impl EngineFactory for NullEngineFactory {
    fn create(&self, _computer: ComputerId) -> Box<dyn GuestEngine> {
        Box::new(NullEngine)
    }
}

struct NullEngine;

impl GuestEngine for NullEngine {
    fn boot(&mut self, script: &BootScript, _api: api::ApiSurface) -> Result<(), EngineError> {
        Err(EngineError::Load {
            name: script.name.clone(),
            message: "no guest engine configured".to_string(),
        })
    }

    fn resume(&mut self, _args: Vec<crate::value::Value>, _hooks: &mut dyn HookSink) -> EngineStatus {
        EngineStatus::Finished
    }
}

// ---------------------------------------------------------------------------
// Computer
// ---------------------------------------------------------------------------

/// A computer as seen from its own thread.
pub struct Computer {
    shared: Arc<ComputerShared>,
    handle: ComputerHandle,
    ctx: HostContext,
    router: EventRouter,
    ready: VecDeque<Event>,
    lifecycle: statig::blocking::StateMachine<Lifecycle>,
    engines: Arc<dyn EngineFactory>,
    boot: BootEntry,
    libraries: Vec<Library>,
}

impl Computer {
    pub fn id(&self) -> ComputerId {
        self.shared.id
    }

    pub fn handle(&self) -> ComputerHandle {
        self.handle.clone()
    }

    pub fn shared(&self) -> &Arc<ComputerShared> {
        &self.shared
    }

    /// Run boots until the computer stops. Blocks the calling thread.
    pub fn run(self) {
        self.run_with_signal(None);
    }

    fn run_with_signal(mut self, mut booted: Option<BootSignal>) {
        let id = self.id();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.boot_loop(&mut booted))) {
            let message = panic_message(payload.as_ref());
            error!(computer = id, panic = %message, "computer thread panicked; tearing down");
            self.teardown();
            self.lifecycle.handle(&LifecycleEvent::Stop);
            if let Some(tx) = booted.take() {
                let _ = tx.send(Err(ComputerError::Panicked(message)));
            }
        }
        self.lifecycle.handle(&LifecycleEvent::TornDown);
        self.finish();
    }

    /// Boot, drive and reboot until the computer stops for good.
    fn boot_loop(&mut self, booted: &mut Option<BootSignal>) {
        let id = self.id();
        loop {
            let mut engine = self.engines.create(id);
            if let Err(e) = self.boot_engine(engine.as_mut()) {
                warn!(computer = id, error = %e, "boot failed");
                self.ctx.notify(
                    Some(self.shared.window),
                    MessageLevel::Error,
                    &format!("Computer {id}"),
                    &format!("Could not start the computer: {e}"),
                );
                self.shared.set_run_level(RunLevel::Stopped);
                self.lifecycle.handle(&LifecycleEvent::Stop);
                if let Some(tx) = booted.take() {
                    let _ = tx.send(Err(e));
                }
                break;
            }
            self.lifecycle.handle(&LifecycleEvent::Booted);
            if let Some(tx) = booted.take() {
                let _ = tx.send(Ok(()));
            }

            self.drive(engine.as_mut());
            drop(engine);
            self.teardown();

            if self.shared.run_level() != RunLevel::Rebooting {
                self.lifecycle.handle(&LifecycleEvent::Stop);
                break;
            }
            info!(computer = id, "rebooting");
            self.lifecycle.handle(&LifecycleEvent::Reboot);
            self.lifecycle.handle(&LifecycleEvent::Restart);
            self.restart();
        }
    }

    fn boot_script(&self) -> Result<BootScript, ComputerError> {
        match &self.boot {
            BootEntry::Embedded(script) => Ok(script.clone()),
            BootEntry::Host(path) => std::fs::read(path)
                .map(|source| BootScript { name: format!("@{}", path.display()), source })
                .map_err(|e| ComputerError::BootMissing {
                    name: path.display().to_string(),
                    reason: e.to_string(),
                }),
            BootEntry::Guest(path) => self
                .shared
                .fs
                .read(path)
                .map(|source| BootScript { name: format!("@/{path}"), source })
                .map_err(|e| ComputerError::BootMissing { name: path.clone(), reason: e.to_string() }),
        }
    }

    fn boot_engine(&mut self, engine: &mut dyn GuestEngine) -> Result<(), ComputerError> {
        let script = self.boot_script()?;
        let mut surface = api::default_surface(&self.ctx, &self.handle);
        for library in &self.libraries {
            surface.install(library.clone());
        }
        engine.boot(&script, surface)?;
        self.shared.set_run_level(RunLevel::Running);
        *self.shared.booted.lock().unwrap_or_else(|e| e.into_inner()) = (Instant::now(), Utc::now());
        Ok(())
    }

    /// Resume the engine with events until it stops.
    fn drive(&mut self, engine: &mut dyn GuestEngine) {
        let id = self.id();
        let now = Instant::now();
        self.shared.governor.reset(now);
        self.shared.governor.arm(self.handle.clone(), now);

        let mut args = Vec::new();
        loop {
            if self.shared.run_level() != RunLevel::Running {
                return;
            }
            let status = {
                let mut hooks = ComputerHooks { shared: &self.shared };
                engine.resume(std::mem::take(&mut args), &mut hooks)
            };
            match status {
                EngineStatus::Yielded(filter) => match self.next_event(filter.as_deref()) {
                    Some(event) => args = event.into_resume_args(),
                    None => return,
                },
                EngineStatus::Finished => {
                    info!(computer = id, "boot script returned");
                    self.shared.set_run_level(RunLevel::Stopped);
                    return;
                }
                EngineStatus::Errored(message) => {
                    warn!(computer = id, error = %message, "guest error stopped the computer");
                    self.shared.display_failure(&message);
                    self.shared.set_run_level(RunLevel::Stopped);
                    return;
                }
                EngineStatus::Aborted => {
                    debug!(computer = id, level = ?self.shared.run_level(), "engine aborted");
                    if self.shared.run_level() == RunLevel::Running {
                        self.shared.set_run_level(RunLevel::Stopped);
                    }
                    return;
                }
            }
        }
    }

    /// Block until an event passes `filter`, or the run level drops.
    ///
    /// Events that do not match are discarded; `terminate` always matches.
    pub fn next_event(&mut self, filter: Option<&str>) -> Option<Event> {
        self.shared.governor.enter_wait();
        let event = self.wait_for_event(filter);
        self.shared
            .governor
            .leave_wait(&self.handle, event.is_some(), Instant::now());
        event
    }

    fn wait_for_event(&mut self, filter: Option<&str>) -> Option<Event> {
        loop {
            if self.shared.run_level() != RunLevel::Running {
                return None;
            }
            self.drain_inbox();
            if self.shared.run_level() != RunLevel::Running {
                return None;
            }
            while let Some(event) = self.ready.pop_front() {
                if event.matches(filter) {
                    return Some(event);
                }
                trace!(computer = self.id(), event = %event.name, ?filter, "event discarded by filter");
            }
            let now = Instant::now();
            if let Some(event) = self.router.flush_due(now) {
                self.ready.push_back(event);
                continue;
            }
            let wait = self
                .router
                .next_deadline()
                .map_or(IDLE_WAKE, |due| due.saturating_duration_since(now).min(IDLE_WAKE));
            self.shared.inbox.wait(wait);
        }
    }

    /// Turn everything queued so far into named events, in arrival order.
    fn drain_inbox(&mut self) {
        while let Some(item) = self.shared.inbox.pop() {
            match item {
                Inbound::Provider(provider) => {
                    let mut args = Vec::new();
                    if let Some(name) = provider(&mut args) {
                        self.ready.push_back(Event::new(name, args));
                    }
                }
                Inbound::Platform(event) => match self.router.route(event) {
                    Routed::Deliver(event) => self.ready.push_back(event),
                    Routed::Control(level, event) => {
                        self.shared.set_run_level(level);
                        self.ready.push_back(event);
                    }
                    Routed::Dropped => {}
                },
            }
        }
    }

    fn teardown(&mut self) {
        self.shared.governor.disarm();
        self.shared.cancel_all_timers();
    }

    fn restart(&mut self) {
        self.ready.clear();
        self.shared.inbox.reopen();
        self.shared.screen.reset();
        self.shared.set_run_level(RunLevel::Running);
    }

    fn finish(self) {
        let shared = &self.shared;
        shared.alive.store(false, Ordering::SeqCst);
        shared.set_run_level(RunLevel::Stopped);
        shared.inbox.close();
        shared.governor.disarm();
        shared.cancel_all_timers();
        shared.clear_debug_link();

        self.ctx.computers.remove(shared.id, shared.generation);
        self.ctx.windows.release(shared.window);
        let monitors = std::mem::take(&mut *shared.monitors.lock().unwrap_or_else(|e| e.into_inner()));
        for window in monitors.into_keys() {
            self.ctx.windows.release(window);
        }
        info!(computer = shared.id, "computer thread finished");
        shared.exited.signal();
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// The computer's side of the engine hook interface.
struct ComputerHooks<'a> {
    shared: &'a ComputerShared,
}

impl HookSink for ComputerHooks<'_> {
    fn count_interval(&self) -> u32 {
        self.shared.governor.hook_interval()
    }

    fn wants_debug_hooks(&self) -> bool {
        self.shared.debug_link().is_some()
    }

    fn on_hook(&mut self, event: HookEvent, frame: &mut dyn FrameAccess) -> HookAction {
        if self.shared.run_level() != RunLevel::Running || self.shared.governor.kill_requested() {
            return HookAction::Abort;
        }
        if let Some(link) = self.shared.debug_link() {
            if link.is_attached() {
                let action = link.on_hook(self.shared, &event, frame);
                if action != HookAction::Continue {
                    return action;
                }
            } else {
                debug!(computer = self.shared.id, "dropping detached debug link");
                self.shared.clear_debug_link();
            }
        }
        match event {
            HookEvent::Count => self.shared.governor.on_count(Instant::now()),
            _ => HookAction::Continue,
        }
    }
}
