//! Shared harness for integration tests: a scripted guest engine and a
//! headless host with its own owner thread and tokio runtime.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use vcomputer::api::ApiSurface;
use vcomputer::computer::{BootEntry, ComputerBuilder, ComputerHandle, HeadlessUi, HostContext};
use vcomputer::config::HostConfig;
use vcomputer::dispatcher::TaskDispatcher;
use vcomputer::engine::{
    BootScript, EngineError, EngineStatus, FrameAccess, FrameInfo, GuestEngine, HookAction, HookEvent,
    HookSink,
};
use vcomputer::value::Value;

/// One instruction of a scripted guest.
#[derive(Debug, Clone)]
pub enum Step {
    /// Yield for the next event, optionally filtered by name.
    Pull(Option<&'static str>),
    /// Call an API function and record the result.
    Call(&'static str, &'static str, Vec<Value>),
    /// Execute `line` of the boot chunk.
    Line(u32),
    /// Burn CPU firing count hooks. A raised error is caught and recorded;
    /// the spin ends after `catches` raises or when the time runs out.
    Spin { budget: Duration, catches: usize },
    /// Burn CPU without catching: the first raised error is fatal.
    Hog(Duration),
}

/// What the guest observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Resume arguments: event name then its arguments.
    Event(Vec<Value>),
    Call(Result<Vec<Value>, String>),
    Line(u32),
    Raised(String),
}

pub type Log = Arc<Mutex<Vec<Record>>>;

pub fn records(log: &Log) -> Vec<Record> {
    log.lock().unwrap().clone()
}

/// Event names recorded so far.
pub fn event_names(log: &Log) -> Vec<String> {
    records(log)
        .into_iter()
        .filter_map(|r| match r {
            Record::Event(args) => args.first().and_then(|v| v.as_str().map(str::to_string)),
            _ => None,
        })
        .collect()
}

/// Poll `f` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ScriptedEngine {
    steps: Vec<Step>,
    pc: usize,
    api: ApiSurface,
    frame: ScriptFrame,
    log: Log,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<Step>, log: Log) -> Self {
        Self { steps, pc: 0, api: ApiSurface::default(), frame: ScriptFrame::default(), log }
    }

    fn record(&self, record: Record) {
        self.log.lock().unwrap().push(record);
    }
}

impl GuestEngine for ScriptedEngine {
    fn boot(&mut self, script: &BootScript, api: ApiSurface) -> Result<(), EngineError> {
        self.api = api;
        self.frame.source = script.name.clone();
        Ok(())
    }

    fn resume(&mut self, args: Vec<Value>, hooks: &mut dyn HookSink) -> EngineStatus {
        if !args.is_empty() {
            self.record(Record::Event(args));
        }
        while let Some(step) = self.steps.get(self.pc).cloned() {
            self.pc += 1;
            match step {
                Step::Pull(filter) => return EngineStatus::Yielded(filter.map(str::to_string)),
                Step::Call(lib, function, args) => {
                    let result = self.api.call(lib, function, &args).map_err(|e| e.to_string());
                    self.record(Record::Call(result));
                }
                Step::Line(line) => {
                    self.frame.line = line;
                    match hooks.on_hook(HookEvent::Line(line), &mut self.frame) {
                        HookAction::Continue => self.record(Record::Line(line)),
                        HookAction::Raise(message) => return EngineStatus::Errored(message),
                        HookAction::Abort => return EngineStatus::Aborted,
                    }
                }
                Step::Spin { budget, catches } => {
                    let deadline = Instant::now() + budget;
                    let mut caught = 0;
                    while caught < catches && Instant::now() < deadline {
                        match hooks.on_hook(HookEvent::Count, &mut self.frame) {
                            HookAction::Continue => std::thread::sleep(Duration::from_millis(1)),
                            HookAction::Raise(message) => {
                                caught += 1;
                                self.record(Record::Raised(message));
                            }
                            HookAction::Abort => return EngineStatus::Aborted,
                        }
                    }
                }
                Step::Hog(budget) => {
                    let deadline = Instant::now() + budget;
                    while Instant::now() < deadline {
                        match hooks.on_hook(HookEvent::Count, &mut self.frame) {
                            HookAction::Continue => std::thread::sleep(Duration::from_millis(1)),
                            HookAction::Raise(message) => {
                                self.record(Record::Raised(message.clone()));
                                return EngineStatus::Errored(message);
                            }
                            HookAction::Abort => return EngineStatus::Aborted,
                        }
                    }
                }
            }
        }
        EngineStatus::Finished
    }
}

/// The single frame a scripted guest runs in.
#[derive(Debug, Default)]
pub struct ScriptFrame {
    pub source: String,
    pub line: u32,
    pub locals: Vec<(String, Value)>,
}

impl FrameAccess for ScriptFrame {
    fn info(&self) -> FrameInfo {
        FrameInfo {
            source: self.source.clone(),
            short_src: self.source.trim_start_matches('@').to_string(),
            name: None,
            what: "main".to_string(),
            current_line: Some(self.line),
            line_defined: Some(0),
        }
    }

    fn locals(&self) -> Vec<(String, Value)> {
        let mut locals = self.locals.clone();
        locals.push(("line".to_string(), Value::Integer(self.line.into())));
        locals
    }

    fn set_local(&mut self, name: &str, value: Value) -> bool {
        match self.locals.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn upvalues(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    fn set_upvalue(&mut self, _name: &str, _value: Value) -> bool {
        false
    }

    fn evaluate(&mut self, code: &str) -> Result<Vec<Value>, String> {
        match code.strip_prefix("return ") {
            Some(name) => Ok(self
                .locals()
                .into_iter()
                .filter(|(n, _)| n == name)
                .map(|(_, v)| v)
                .collect()),
            None => Err(format!("cannot evaluate {code:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// A headless host for one test.
pub struct TestHost {
    pub ctx: HostContext,
    pub data: tempfile::TempDir,
    runtime: Option<tokio::runtime::Runtime>,
    owner: Option<JoinHandle<()>>,
}

impl TestHost {
    pub fn new(config: HostConfig) -> Self {
        let data = tempfile::tempdir().unwrap();
        let config = HostConfig { data_dir: Some(data.path().to_path_buf()), ..config };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (dispatcher, owner) = TaskDispatcher::spawn_owner("test-owner").unwrap();
        let ctx = HostContext::new(config, dispatcher, runtime.handle().clone(), Arc::new(HeadlessUi));
        Self { ctx, data, runtime: Some(runtime), owner: Some(owner) }
    }

    pub fn runtime(&self) -> &tokio::runtime::Runtime {
        self.runtime.as_ref().unwrap()
    }

    /// Start computer `id` running `steps` from a chunk named `@/a.lua`.
    pub fn start(&self, id: u32, steps: Vec<Step>) -> (ComputerHandle, Log) {
        let (builder, log) = self.builder(id, steps);
        (builder.start().unwrap(), log)
    }

    pub fn builder(&self, id: u32, steps: Vec<Step>) -> (ComputerBuilder, Log) {
        let log: Log = Arc::default();
        let engine_log = Arc::clone(&log);
        let factory = move |_id: u32| -> Box<dyn GuestEngine> {
            Box::new(ScriptedEngine::new(steps.clone(), Arc::clone(&engine_log)))
        };
        let builder = ComputerBuilder::new(self.ctx.clone(), id)
            .engine(Arc::new(factory))
            .boot(BootEntry::Embedded(BootScript { name: "@/a.lua".into(), source: Vec::new() }));
        (builder, log)
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.ctx.shutdown();
        self.ctx.dispatcher.shutdown();
        if let Some(owner) = self.owner.take() {
            let _ = owner.join();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}
