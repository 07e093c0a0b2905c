//! Pausing a live guest thread under external control.
//!
//! ```text
//!  target computer thread                   monitor (or host) thread
//!  ──────────────────────                   ────────────────────────
//!  hook matches breakpoint / step / catch
//!    paused = {reason, frame}
//!    notify monitor "debugger_break"  ───►  getLocals / run / setLocal
//!    wait (500 ms polls) ◄── FrameRequest ──┘
//!    serve request on own stack ── FrameReply ──►
//!    wait ◄── continuation (step | stepOut | continue)
//!  resume
//! ```
//!
//! The two threads rendezvous through [`DebugLink`]'s mutex and condvar.
//! The paused stack never leaves its thread: every frame read or write is
//! shipped to the guest thread as a request and answered there.
//!
//! The target holds only a `Weak` to the link. Detaching clears the
//! `attached` flag, wakes a paused thread, and the target drops the link at
//! its next hook.

pub mod breakpoints;
pub mod library;
pub mod profile;

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use statig::prelude::*;
use tracing::{debug, info, warn};

pub use breakpoints::{BreakLocation, Breakpoint, BreakpointTable};
pub use profile::{ProfileEntry, Profiler};

use crate::computer::{
    BootEntry, ComputerBuilder, ComputerError, ComputerHandle, ComputerShared, HostContext, RunLevel,
};
use crate::engine::{EngineFactory, FrameAccess, FrameInfo, HookAction, HookEvent};
use crate::event::Event;
use crate::state_machine::debug_sm::{DebugEvent, DebugFlow};
use crate::value::Value;
use crate::vfs::Backing;

/// Bounded wait used while paused, so a torn-down target never parks forever.
const PAUSE_POLL: Duration = Duration::from_millis(500);
/// How long a monitor waits for the paused thread to answer a frame request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    #[error("debugging is disabled in the host configuration")]
    Disabled,
    #[error("computer {0} already has a debugger attached")]
    AlreadyAttached(u32),
    #[error("debugger is detached")]
    Detached,
    #[error("target computer is gone")]
    TargetGone,
    #[error("target is not paused")]
    NotPaused,
    #[error("paused thread did not answer in time")]
    Timeout,
    #[error("invalid breakpoint path {0}")]
    BadPath(String),
    #[error("unknown catch class {0}")]
    UnknownCatch(String),
    #[error("{0}")]
    Eval(String),
    #[error("failed to start the monitor computer")]
    Monitor(#[source] ComputerError),
}

/// Hook classes that can pause the target on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchClass {
    Error,
    Load,
    Run,
    Resume,
    Yield,
}

impl CatchClass {
    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl FromStr for CatchClass {
    type Err = DebugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(CatchClass::Error),
            "load" => Ok(CatchClass::Load),
            "run" => Ok(CatchClass::Run),
            "resume" => Ok(CatchClass::Resume),
            "yield" => Ok(CatchClass::Yield),
            other => Err(DebugError::UnknownCatch(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakType {
    Nonstop,
    /// Stop at the next line hook.
    Line,
    /// Stop when the paused function returns.
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuation {
    Step,
    StepOut,
    Continue,
}

/// Why and where the target is paused.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseInfo {
    pub reason: String,
    pub frame: FrameInfo,
}

enum FrameRequest {
    Locals,
    Upvalues,
    SetLocal(String, Value),
    SetUpvalue(String, Value),
    Evaluate(String),
}

enum FrameReply {
    Vars(Vec<(String, Value)>),
    Set(bool),
    Evaluated(Result<Vec<Value>, String>),
}

fn serve(frame: &mut dyn FrameAccess, request: FrameRequest) -> FrameReply {
    match request {
        FrameRequest::Locals => FrameReply::Vars(frame.locals()),
        FrameRequest::Upvalues => FrameReply::Vars(frame.upvalues()),
        FrameRequest::SetLocal(name, value) => FrameReply::Set(frame.set_local(&name, value)),
        FrameRequest::SetUpvalue(name, value) => FrameReply::Set(frame.set_upvalue(&name, value)),
        FrameRequest::Evaluate(code) => FrameReply::Evaluated(frame.evaluate(&code)),
    }
}

struct LinkState {
    flow: statig::blocking::StateMachine<DebugFlow>,
    break_type: BreakType,
    depth: i64,
    return_depth: i64,
    catch: u8,
    paused: Option<PauseInfo>,
    continuation: Option<Continuation>,
    request: Option<(u64, FrameRequest)>,
    reply: Option<(u64, FrameReply)>,
    next_seq: u64,
    wait_for_break: bool,
    profiler: Profiler,
}

/// Rendezvous between a target computer and whoever is debugging it.
pub struct DebugLink {
    target: ComputerHandle,
    attached: AtomicBool,
    state: Mutex<LinkState>,
    cv: Condvar,
    monitor: Mutex<Option<ComputerHandle>>,
}

impl DebugLink {
    fn new(target: ComputerHandle) -> Self {
        let mut flow = DebugFlow::default().state_machine();
        flow.handle(&DebugEvent::Attach);
        Self {
            target,
            attached: AtomicBool::new(true),
            state: Mutex::new(LinkState {
                flow,
                break_type: BreakType::Nonstop,
                depth: 0,
                return_depth: 0,
                catch: 0,
                paused: None,
                continuation: None,
                request: None,
                reply: None,
                next_seq: 1,
                wait_for_break: false,
                profiler: Profiler::default(),
            }),
            cv: Condvar::new(),
            monitor: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn target(&self) -> &ComputerHandle {
        &self.target
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn target_shared(&self) -> Result<Arc<ComputerShared>, DebugError> {
        if !self.is_attached() {
            return Err(DebugError::Detached);
        }
        self.target.upgrade().ok_or(DebugError::TargetGone)
    }

    // -----------------------------------------------------------------------
    // Guest thread side
    // -----------------------------------------------------------------------

    /// Called from the target's hook. May block until a continuation arrives.
    pub(crate) fn on_hook(
        &self,
        shared: &ComputerShared,
        event: &HookEvent,
        frame: &mut dyn FrameAccess,
    ) -> HookAction {
        let now = Instant::now();
        let line_breakpoint = match event {
            HookEvent::Line(line) => {
                let table = shared.breakpoints();
                !table.is_empty() && table.matches_line(&frame.info().source, *line)
            }
            _ => false,
        };

        let mut st = self.lock();
        let reason = match event {
            HookEvent::Count => None,
            HookEvent::Line(_) => {
                if st.break_type == BreakType::Line {
                    Some("Pause".to_string())
                } else if line_breakpoint {
                    Some("Breakpoint".to_string())
                } else {
                    None
                }
            }
            HookEvent::Call => {
                st.depth += 1;
                let info = frame.info();
                st.profiler.on_call(&info, now);
                let name = info.name.unwrap_or_default();
                let caught = match name.rsplit('.').next().unwrap_or_default() {
                    "load" | "loadstring" | "dofile" => st.catch & CatchClass::Load.bit() != 0,
                    "run" => st.catch & CatchClass::Run.bit() != 0,
                    _ => false,
                };
                if shared.breakpoints().matches_function(&name) {
                    Some("Breakpoint".to_string())
                } else if caught {
                    Some("Caught call".to_string())
                } else {
                    None
                }
            }
            HookEvent::Return => {
                st.profiler.on_return(now);
                let hit = st.break_type == BreakType::Return && st.depth <= st.return_depth;
                st.depth -= 1;
                hit.then(|| "Pause".to_string())
            }
            HookEvent::Error(message) => {
                (st.catch & CatchClass::Error.bit() != 0).then(|| message.clone())
            }
            HookEvent::Resume => {
                (st.catch & CatchClass::Resume.bit() != 0).then(|| "Resume".to_string())
            }
            HookEvent::Yield => {
                (st.catch & CatchClass::Yield.bit() != 0).then(|| "Yield".to_string())
            }
        };

        match reason {
            Some(reason) => self.pause_here(shared, st, reason, frame),
            None => HookAction::Continue,
        }
    }

    fn pause_here<'a>(
        &'a self,
        shared: &ComputerShared,
        mut st: MutexGuard<'a, LinkState>,
        reason: String,
        frame: &mut dyn FrameAccess,
    ) -> HookAction {
        let info = frame.info();
        info!(computer = shared.id(), reason = %reason, source = %info.source, line = ?info.current_line, "paused");
        st.flow.handle(&DebugEvent::Break { reason: reason.clone() });
        st.paused = Some(PauseInfo { reason: reason.clone(), frame: info });
        st.continuation = None;
        st.break_type = BreakType::Nonstop;
        let notify = std::mem::take(&mut st.wait_for_break);
        shared.governor.suspend();
        self.cv.notify_all();
        if notify {
            self.notify_monitor(&reason);
        }

        let decision = loop {
            if !self.is_attached() || shared.run_level() != RunLevel::Running {
                break None;
            }
            if let Some(c) = st.continuation.take() {
                break Some(c);
            }
            if let Some((seq, request)) = st.request.take() {
                drop(st);
                let reply = serve(frame, request);
                st = self.lock();
                st.reply = Some((seq, reply));
                self.cv.notify_all();
                continue;
            }
            st = self
                .cv
                .wait_timeout(st, PAUSE_POLL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        };

        st.paused = None;
        st.request = None;
        match decision {
            Some(Continuation::Step) => st.break_type = BreakType::Line,
            Some(Continuation::StepOut) => {
                st.break_type = BreakType::Return;
                st.return_depth = st.depth;
            }
            Some(Continuation::Continue) | None => {}
        }
        st.flow.handle(&DebugEvent::Resumed);
        drop(st);
        self.cv.notify_all();
        shared.governor.resume(Instant::now());
        debug!(computer = shared.id(), ?decision, "resumed");

        if decision.is_none() && shared.run_level() != RunLevel::Running {
            HookAction::Abort
        } else {
            HookAction::Continue
        }
    }

    fn notify_monitor(&self, reason: &str) {
        let monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(monitor) = monitor {
            monitor.queue_named(Event::new("debugger_break", vec![reason.into()]));
        }
    }

    // -----------------------------------------------------------------------
    // Controller side
    // -----------------------------------------------------------------------

    pub fn set_breakpoint(&self, file: &str, line: u32) -> Result<u32, DebugError> {
        self.target_shared()?
            .breakpoints()
            .add_line(file, line)
            .ok_or_else(|| DebugError::BadPath(file.to_string()))
    }

    pub fn set_function_breakpoint(&self, name: &str) -> Result<u32, DebugError> {
        Ok(self.target_shared()?.breakpoints().add_function(name))
    }

    pub fn unset_breakpoint(&self, id: u32) -> Result<bool, DebugError> {
        Ok(self.target_shared()?.breakpoints().remove(id))
    }

    pub fn list_breakpoints(&self) -> Result<Vec<Breakpoint>, DebugError> {
        Ok(self.target_shared()?.breakpoints().list())
    }

    fn resume_with(&self, continuation: Continuation) -> bool {
        let mut st = self.lock();
        if st.paused.is_none() || st.continuation.is_some() {
            warn!(computer = self.target.id(), ?continuation, "continuation without a paused thread ignored");
            return false;
        }
        st.flow.handle(&match continuation {
            Continuation::Step => DebugEvent::Step,
            Continuation::StepOut => DebugEvent::StepOut,
            Continuation::Continue => DebugEvent::Continue,
        });
        st.continuation = Some(continuation);
        drop(st);
        self.cv.notify_all();
        true
    }

    /// Resume and stop again at the next line.
    pub fn step(&self) -> bool {
        self.resume_with(Continuation::Step)
    }

    /// Resume and stop when the paused function returns.
    pub fn step_out(&self) -> bool {
        self.resume_with(Continuation::StepOut)
    }

    pub fn continue_(&self) -> bool {
        self.resume_with(Continuation::Continue)
    }

    /// Break at the next line the target executes.
    pub fn pause(&self) -> bool {
        let mut st = self.lock();
        if st.paused.is_some() {
            return false;
        }
        st.break_type = BreakType::Line;
        true
    }

    /// Ask for a `debugger_break` event on the monitor at the next pause.
    /// If already paused the event is queued at once.
    pub fn wait_for_break(&self) {
        let mut st = self.lock();
        match &st.paused {
            Some(paused) => {
                let reason = paused.reason.clone();
                drop(st);
                self.notify_monitor(&reason);
            }
            None => st.wait_for_break = true,
        }
    }

    /// Block the calling thread until the target pauses.
    pub fn wait_until_paused(&self, timeout: Duration) -> Option<PauseInfo> {
        let st = self.lock();
        let (st, _) = self
            .cv
            .wait_timeout_while(st, timeout, |st| st.paused.is_none() && self.is_attached())
            .unwrap_or_else(|e| e.into_inner());
        st.paused.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused.is_some()
    }

    pub fn get_info(&self) -> Option<PauseInfo> {
        self.lock().paused.clone()
    }

    fn request(&self, request: FrameRequest) -> Result<FrameReply, DebugError> {
        let mut st = self.lock();
        if st.paused.is_none() {
            return Err(DebugError::NotPaused);
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        st.request = Some((seq, request));
        self.cv.notify_all();

        let deadline = Instant::now() + REQUEST_TIMEOUT;
        loop {
            if let Some((s, reply)) = st.reply.take() {
                if s == seq {
                    return Ok(reply);
                }
            }
            if st.paused.is_none() || !self.is_attached() {
                return Err(DebugError::NotPaused);
            }
            let now = Instant::now();
            if now >= deadline {
                st.request = None;
                return Err(DebugError::Timeout);
            }
            st = self
                .cv
                .wait_timeout(st, (deadline - now).min(PAUSE_POLL))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    pub fn get_locals(&self) -> Result<Vec<(String, Value)>, DebugError> {
        match self.request(FrameRequest::Locals)? {
            FrameReply::Vars(vars) => Ok(vars),
            _ => Ok(Vec::new()),
        }
    }

    pub fn get_upvalues(&self) -> Result<Vec<(String, Value)>, DebugError> {
        match self.request(FrameRequest::Upvalues)? {
            FrameReply::Vars(vars) => Ok(vars),
            _ => Ok(Vec::new()),
        }
    }

    pub fn set_local(&self, name: &str, value: Value) -> Result<bool, DebugError> {
        match self.request(FrameRequest::SetLocal(name.to_string(), value))? {
            FrameReply::Set(ok) => Ok(ok),
            _ => Ok(false),
        }
    }

    pub fn set_upvalue(&self, name: &str, value: Value) -> Result<bool, DebugError> {
        match self.request(FrameRequest::SetUpvalue(name.to_string(), value))? {
            FrameReply::Set(ok) => Ok(ok),
            _ => Ok(false),
        }
    }

    /// Evaluate `code` in the paused frame's scope.
    pub fn run(&self, code: &str) -> Result<Vec<Value>, DebugError> {
        match self.request(FrameRequest::Evaluate(code.to_string()))? {
            FrameReply::Evaluated(result) => result.map_err(DebugError::Eval),
            _ => Ok(Vec::new()),
        }
    }

    pub fn catch(&self, class: CatchClass) {
        self.lock().catch |= class.bit();
    }

    pub fn uncatch(&self, class: CatchClass) {
        self.lock().catch &= !class.bit();
    }

    pub fn start_profiling(&self, enabled: bool) {
        self.lock().profiler.set_enabled(enabled);
    }

    pub fn profile(&self) -> Value {
        self.lock().profiler.report()
    }

    /// `detached`, `running`, `paused`, `stepping` or `continuing`.
    pub fn status(&self) -> &'static str {
        self.lock().flow.state().label()
    }

    fn detach(&self) {
        if !self.attached.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut st = self.lock();
        st.flow.handle(&DebugEvent::Detach);
        st.break_type = BreakType::Nonstop;
        st.catch = 0;
        drop(st);
        self.cv.notify_all();
        info!(computer = self.target.id(), "debugger detached");
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// How to start the monitor computer that hosts the debugger's own UI.
pub struct MonitorSpec {
    pub engine: Arc<dyn EngineFactory>,
    pub boot: BootEntry,
    /// Mounted read-only at `debug` on the monitor.
    pub debug_mount: Option<Backing>,
}

/// An attached debugger. Owns the link and the monitor computer; dropping
/// it detaches.
pub struct DebugSession {
    link: Arc<DebugLink>,
    monitor: Option<ComputerHandle>,
}

impl DebugSession {
    pub fn attach(
        ctx: &HostContext,
        target: &ComputerHandle,
        monitor: Option<MonitorSpec>,
    ) -> Result<Self, DebugError> {
        if !ctx.config.debug_enable {
            return Err(DebugError::Disabled);
        }
        let shared = target.upgrade().ok_or(DebugError::TargetGone)?;
        if shared.debug_link().is_some_and(|l| l.is_attached()) {
            return Err(DebugError::AlreadyAttached(target.id()));
        }

        let link = Arc::new(DebugLink::new(target.clone()));
        let monitor = match monitor {
            Some(spec) => Some(start_monitor(ctx, &link, spec)?),
            None => None,
        };
        *link.monitor.lock().unwrap_or_else(|e| e.into_inner()) = monitor.clone();
        shared.set_debug_link(Arc::downgrade(&link));
        info!(computer = target.id(), monitor = ?monitor.as_ref().map(|m| m.id()), "debugger attached");
        Ok(Self { link, monitor })
    }

    pub fn link(&self) -> &Arc<DebugLink> {
        &self.link
    }

    pub fn monitor(&self) -> Option<&ComputerHandle> {
        self.monitor.as_ref()
    }

    pub fn detach(self) {}
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.link.detach();
        if let Some(monitor) = self.monitor.take() {
            monitor.shutdown();
        }
    }
}

fn start_monitor(
    ctx: &HostContext,
    link: &Arc<DebugLink>,
    spec: MonitorSpec,
) -> Result<ComputerHandle, DebugError> {
    let id = ctx.computers.next_free_id();
    let mut builder = ComputerBuilder::new(ctx.clone(), id)
        .engine(spec.engine)
        .boot(spec.boot)
        .library(library::debugger_library(Arc::downgrade(link)));
    if let Some(backing) = spec.debug_mount {
        builder = builder.system_mount("debug", backing, true);
    }
    builder.start().map_err(DebugError::Monitor)
}
