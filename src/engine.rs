//! The embedded interpreter, seen from the host.
//!
//! The host never interprets guest code itself. A [`GuestEngine`] runs the
//! boot script, calls back into a [`HookSink`] at instruction-count, line,
//! call, return, error, resume and yield points, and exposes the current
//! frame through [`FrameAccess`] while a hook runs.
//!
//! ```text
//!  Computer thread
//!    └── engine.resume(args, hooks)
//!          ├── hooks.on_hook(Count | Line | Call | ..., frame) ──► HookAction
//!          └── returns EngineStatus::{Yielded(filter), Finished, Errored, Aborted}
//! ```

use crate::api::ApiSurface;
use crate::computer::ComputerId;
use crate::value::Value;

/// A hook point reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    /// Every `HookSink::count_interval` instructions.
    Count,
    /// A new source line is about to execute.
    Line(u32),
    Call,
    Return,
    /// A guest error is being raised.
    Error(String),
    /// A coroutine is being resumed.
    Resume,
    /// A coroutine is yielding.
    Yield,
}

/// What the engine should do after a hook returns.
#[derive(Debug, Clone, PartialEq)]
pub enum HookAction {
    Continue,
    /// Raise a catchable guest error at the current point.
    Raise(String),
    /// Unwind everything and return [`EngineStatus::Aborted`].
    Abort,
}

/// Summary of the frame a hook fired in.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct FrameInfo {
    /// Chunk name, e.g. `@/startup.lua` or `=bios`.
    pub source: String,
    pub short_src: String,
    pub name: Option<String>,
    /// `Lua`, `C`, `main` or similar, as the engine reports it.
    pub what: String,
    pub current_line: Option<u32>,
    pub line_defined: Option<u32>,
}

/// Introspection of the paused frame. Only valid for the duration of a hook
/// and only on the engine's own thread.
pub trait FrameAccess {
    fn info(&self) -> FrameInfo;
    fn locals(&self) -> Vec<(String, Value)>;
    fn set_local(&mut self, name: &str, value: Value) -> bool;
    fn upvalues(&self) -> Vec<(String, Value)>;
    fn set_upvalue(&mut self, name: &str, value: Value) -> bool;
    /// Evaluate `code` with the frame's locals and upvalues in scope,
    /// leaving the frame's own stack untouched.
    fn evaluate(&mut self, code: &str) -> Result<Vec<Value>, String>;
}

/// Host side of the hook interface.
pub trait HookSink {
    /// Instructions between [`HookEvent::Count`] callbacks.
    fn count_interval(&self) -> u32;
    /// Whether the engine needs to report line/call/return hooks at all.
    fn wants_debug_hooks(&self) -> bool;
    fn on_hook(&mut self, event: HookEvent, frame: &mut dyn FrameAccess) -> HookAction;
}

/// How a `resume` call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    /// The guest wants the next event, optionally filtered by name.
    Yielded(Option<String>),
    /// The boot script returned.
    Finished,
    /// An uncaught guest error.
    Errored(String),
    /// A hook asked for [`HookAction::Abort`].
    Aborted,
}

/// The boot script handed to a fresh engine.
#[derive(Debug, Clone)]
pub struct BootScript {
    pub name: String,
    pub source: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("boot script {name} failed to load: {message}")]
    Load { name: String, message: String },
}

/// One interpreter instance, owned by a single computer thread.
pub trait GuestEngine: Send {
    /// Load the boot script and bind the API surface.
    fn boot(&mut self, script: &BootScript, api: ApiSurface) -> Result<(), EngineError>;
    /// Run until the guest yields for an event, returns, or errors.
    fn resume(&mut self, args: Vec<Value>, hooks: &mut dyn HookSink) -> EngineStatus;
}

/// Creates a fresh engine for every boot and reboot.
pub trait EngineFactory: Send + Sync {
    fn create(&self, computer: ComputerId) -> Box<dyn GuestEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(ComputerId) -> Box<dyn GuestEngine> + Send + Sync,
{
    fn create(&self, computer: ComputerId) -> Box<dyn GuestEngine> {
        self(computer)
    }
}
