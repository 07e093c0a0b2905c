//! Platform input → named guest events.
//!
//! ```text
//!  PlatformEvent ──► HandlerRegistry::intercept ──consumed──► (dropped)
//!                          │ not consumed
//!                          ▼
//!                    EventRouter::translate ──► Routed::{Deliver, Control, Dropped}
//! ```
//!
//! The router runs on the owning computer's thread while it drains its
//! inbox, so translation state (held shortcut keys, last mouse position,
//! throttled `mouse_move`) needs no locking.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::computer::{ComputerId, RunLevel};
use crate::event::{Event, TERMINATE};
use crate::screen::{Screen, WindowId, size_in_range};
use crate::value::Value;
use crate::vfs::SandboxFs;

/// Raw input as delivered by a renderer or a remote client.
///
/// Coordinates are 1-based character cells (or pixels in graphics modes).
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    Quit,
    KeyDown { key: u8, repeat: bool, ctrl: bool },
    KeyUp { key: u8 },
    Text(String),
    Paste(String),
    MouseDown { window: WindowId, button: u8, x: i32, y: i32 },
    MouseUp { window: WindowId, button: u8, x: i32, y: i32 },
    MouseWheel { window: WindowId, direction: i32, x: i32, y: i32 },
    MouseMove { window: WindowId, button: Option<u8>, x: i32, y: i32 },
    MouseLeave { window: WindowId },
    Resize { window: WindowId, width: u32, height: u32 },
    WindowClose { window: WindowId },
    FileDrop { paths: Vec<PathBuf> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformEventKind {
    Quit,
    Key,
    Text,
    Paste,
    Mouse,
    Window,
    FileDrop,
}

impl PlatformEvent {
    pub fn kind(&self) -> PlatformEventKind {
        match self {
            PlatformEvent::Quit => PlatformEventKind::Quit,
            PlatformEvent::KeyDown { .. } | PlatformEvent::KeyUp { .. } => PlatformEventKind::Key,
            PlatformEvent::Text(_) => PlatformEventKind::Text,
            PlatformEvent::Paste(_) => PlatformEventKind::Paste,
            PlatformEvent::MouseDown { .. }
            | PlatformEvent::MouseUp { .. }
            | PlatformEvent::MouseWheel { .. }
            | PlatformEvent::MouseMove { .. }
            | PlatformEvent::MouseLeave { .. } => PlatformEventKind::Mouse,
            PlatformEvent::Resize { .. } | PlatformEvent::WindowClose { .. } => {
                PlatformEventKind::Window
            }
            PlatformEvent::FileDrop { .. } => PlatformEventKind::FileDrop,
        }
    }

    /// Window the event targets, if it is window-specific.
    pub fn window(&self) -> Option<WindowId> {
        match self {
            PlatformEvent::MouseDown { window, .. }
            | PlatformEvent::MouseUp { window, .. }
            | PlatformEvent::MouseWheel { window, .. }
            | PlatformEvent::MouseMove { window, .. }
            | PlatformEvent::MouseLeave { window }
            | PlatformEvent::Resize { window, .. }
            | PlatformEvent::WindowClose { window } => Some(*window),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Interception hook chain
// ---------------------------------------------------------------------------

/// Returns `true` to consume the event before translation.
pub type PlatformHandler = Arc<dyn Fn(&PlatformEvent, ComputerId) -> bool + Send + Sync>;

/// Host-wide interception handlers, run in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<(PlatformEventKind, PlatformHandler)>>,
}

impl HandlerRegistry {
    pub fn register(&self, kind: PlatformEventKind, handler: PlatformHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind, handler));
    }

    /// Run the chain. Stops at the first handler that consumes the event.
    pub fn intercept(&self, event: &PlatformEvent, computer: ComputerId) -> bool {
        let kind = event.kind();
        let matching: Vec<PlatformHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| Arc::clone(h))
            .collect();
        matching.iter().any(|handler| handler(event, computer))
    }
}

// ---------------------------------------------------------------------------
// Key codes
// ---------------------------------------------------------------------------

pub mod keys {
    pub const R: u8 = 19;
    pub const T: u8 = 20;
    pub const S: u8 = 31;
    pub const V: u8 = 47;
    pub const ENTER: u8 = 28;
    pub const SPACE: u8 = 57;

    /// Keys-API code for a platform key name.
    pub fn code(name: &str) -> Option<u8> {
        let lower = name.to_ascii_lowercase();
        if lower.len() == 1 {
            let c = lower.as_bytes()[0];
            const LETTERS: &[u8; 26] = &[
                30, 48, 46, 32, 18, 33, 34, 35, 23, 36, 37, 38, 50, 49, 24, 25, 16, 19, 31, 20, 22,
                47, 17, 45, 21, 44,
            ];
            return match c {
                b'a'..=b'z' => Some(LETTERS[(c - b'a') as usize]),
                b'1'..=b'9' => Some(c - b'1' + 2),
                b'0' => Some(11),
                b'-' => Some(12),
                b'=' => Some(13),
                b'[' => Some(26),
                b']' => Some(27),
                b';' => Some(39),
                b'\'' => Some(40),
                b'`' => Some(41),
                b'\\' => Some(43),
                b',' => Some(51),
                b'.' => Some(52),
                b'/' => Some(53),
                _ => None,
            };
        }
        if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
            return match n {
                1..=10 => Some(58 + n),
                11 => Some(87),
                12 => Some(88),
                13..=15 => Some(100 + n - 13),
                _ => None,
            };
        }
        Some(match lower.as_str() {
            "backspace" => 14,
            "tab" => 15,
            "return" | "enter" => ENTER,
            "leftctrl" | "lctrl" => 29,
            "leftshift" | "lshift" => 42,
            "rightshift" | "rshift" => 54,
            "leftalt" | "lalt" => 56,
            "space" => SPACE,
            "capslock" => 58,
            "numlock" => 69,
            "scrolllock" => 70,
            "rightctrl" | "rctrl" => 157,
            "rightalt" | "ralt" => 184,
            "pause" => 197,
            "home" => 199,
            "up" => 200,
            "pageup" => 201,
            "left" => 203,
            "right" => 205,
            "end" => 207,
            "down" => 208,
            "pagedown" => 209,
            "insert" => 210,
            "delete" => 211,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// What the event loop should do with a translated platform event.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Deliver(Event),
    /// Change the run level, then deliver the event.
    Control(RunLevel, Event),
    Dropped,
}

// Held-shortcut bits: armed on the first press, fired on the repeat.
const TERMINATE_ARMED: u8 = 1;
const TERMINATE_FIRED: u8 = 2;
const SHUTDOWN_ARMED: u8 = 4;
const SHUTDOWN_FIRED: u8 = 8;
const REBOOT_ARMED: u8 = 16;
const REBOOT_FIRED: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MouseSample {
    window: WindowId,
    button: u8,
    x: i32,
    y: i32,
}

/// Router settings taken from the host configuration.
#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    /// `None` disables `mouse_move` entirely.
    pub mouse_move_throttle: Option<Duration>,
    pub monitors_use_mouse_events: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            mouse_move_throttle: Some(Duration::from_millis(100)),
            monitors_use_mouse_events: false,
        }
    }
}

/// Per-computer translation state.
pub struct EventRouter {
    computer: ComputerId,
    main_window: WindowId,
    monitors: Arc<Mutex<BTreeMap<WindowId, String>>>,
    screen: Arc<Screen>,
    fs: SandboxFs,
    handlers: Arc<HandlerRegistry>,
    options: RouterOptions,
    held: u8,
    last_drag: Option<MouseSample>,
    last_move: Option<Instant>,
    pending_move: Option<(Instant, Event)>,
}

impl EventRouter {
    pub fn new(
        computer: ComputerId,
        main_window: WindowId,
        monitors: Arc<Mutex<BTreeMap<WindowId, String>>>,
        screen: Arc<Screen>,
        fs: SandboxFs,
        handlers: Arc<HandlerRegistry>,
        options: RouterOptions,
    ) -> Self {
        Self {
            computer,
            main_window,
            monitors,
            screen,
            fs,
            handlers,
            options,
            held: 0,
            last_drag: None,
            last_move: None,
            pending_move: None,
        }
    }

    fn monitor_side(&self, window: WindowId) -> Option<String> {
        if window == self.main_window {
            return None;
        }
        self.monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&window)
            .cloned()
    }

    /// Run the interception chain, then translate.
    pub fn route(&mut self, event: PlatformEvent) -> Routed {
        if self.handlers.intercept(&event, self.computer) {
            debug!(computer = self.computer, kind = ?event.kind(), "platform event consumed by handler");
            return Routed::Dropped;
        }
        self.translate(event, Instant::now())
    }

    pub fn translate(&mut self, event: PlatformEvent, now: Instant) -> Routed {
        match event {
            PlatformEvent::Quit => Routed::Control(RunLevel::Stopped, Event::named(TERMINATE)),
            PlatformEvent::KeyDown { key, repeat, ctrl } => self.key_down(key, repeat, ctrl),
            PlatformEvent::KeyUp { key } => {
                self.held = 0;
                Routed::Deliver(Event::new("key_up", vec![Value::from(key as i64)]))
            }
            PlatformEvent::Text(text) => match text.chars().next() {
                Some(c) => Routed::Deliver(Event::new("char", vec![Value::String(c.to_string())])),
                None => Routed::Dropped,
            },
            PlatformEvent::Paste(text) => {
                Routed::Deliver(Event::new("paste", vec![Value::String(text)]))
            }
            PlatformEvent::MouseDown { window, button, x, y } => {
                self.last_drag = None;
                match self.monitor_side(window) {
                    Some(side) if !self.options.monitors_use_mouse_events => Routed::Deliver(
                        Event::new("monitor_touch", vec![side.into(), x.into(), y.into()]),
                    ),
                    side => Routed::Deliver(Event::new(
                        "mouse_click",
                        mouse_args(button as i64, x, y, side),
                    )),
                }
            }
            PlatformEvent::MouseUp { window, button, x, y } => {
                self.last_drag = None;
                match self.monitor_side(window) {
                    Some(_) if !self.options.monitors_use_mouse_events => Routed::Dropped,
                    side => Routed::Deliver(Event::new("mouse_up", mouse_args(button as i64, x, y, side))),
                }
            }
            PlatformEvent::MouseWheel { window, direction, x, y } => {
                match self.monitor_side(window) {
                    Some(_) if !self.options.monitors_use_mouse_events => Routed::Dropped,
                    side => Routed::Deliver(Event::new(
                        "mouse_scroll",
                        mouse_args(direction.clamp(-1, 1) as i64, x, y, side),
                    )),
                }
            }
            PlatformEvent::MouseMove { window, button: Some(button), x, y } => {
                let sample = MouseSample { window, button, x, y };
                if self.last_drag == Some(sample) {
                    return Routed::Dropped;
                }
                self.last_drag = Some(sample);
                match self.monitor_side(window) {
                    Some(_) if !self.options.monitors_use_mouse_events => Routed::Dropped,
                    side => Routed::Deliver(Event::new("mouse_drag", mouse_args(button as i64, x, y, side))),
                }
            }
            PlatformEvent::MouseMove { window, button: None, x, y } => {
                if self.monitor_side(window).is_some() {
                    return Routed::Dropped;
                }
                self.throttle_move(Event::new("mouse_move", vec![1.into(), x.into(), y.into()]), now)
            }
            PlatformEvent::MouseLeave { window } => {
                if self.monitor_side(window).is_some() {
                    return Routed::Dropped;
                }
                self.pending_move = None;
                self.throttle_move(
                    Event::new("mouse_move", vec![1.into(), Value::Nil, Value::Nil]),
                    now,
                )
            }
            PlatformEvent::Resize { window, width, height } => match self.monitor_side(window) {
                Some(side) => Routed::Deliver(Event::new("monitor_resize", vec![side.into()])),
                None if window == self.main_window => {
                    if !size_in_range(width, height) {
                        warn!(computer = self.computer, width, height, "ignoring out-of-range resize");
                        return Routed::Dropped;
                    }
                    self.screen.update(|frame| frame.resize(width, height));
                    Routed::Deliver(Event::named("term_resize"))
                }
                None => Routed::Dropped,
            },
            PlatformEvent::WindowClose { window } => {
                if window == self.main_window {
                    return Routed::Control(RunLevel::Stopped, Event::named(TERMINATE));
                }
                let removed = self
                    .monitors
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&window);
                if let Some(side) = removed {
                    debug!(computer = self.computer, side = %side, "monitor window closed");
                }
                Routed::Dropped
            }
            PlatformEvent::FileDrop { paths } => self.file_drop(&paths),
        }
    }

    fn key_down(&mut self, key: u8, repeat: bool, ctrl: bool) -> Routed {
        let key_event = Event::new("key", vec![Value::from(key as i64), Value::Bool(repeat)]);
        if !ctrl {
            self.held = 0;
            return Routed::Deliver(key_event);
        }
        let (armed, fired, action) = match key {
            keys::T => (TERMINATE_ARMED, TERMINATE_FIRED, None),
            keys::S => (SHUTDOWN_ARMED, SHUTDOWN_FIRED, Some(RunLevel::Stopped)),
            keys::R => (REBOOT_ARMED, REBOOT_FIRED, Some(RunLevel::Rebooting)),
            _ => {
                self.held = 0;
                return Routed::Deliver(key_event);
            }
        };
        if self.held & armed != 0 {
            self.held = (self.held | fired) & !armed;
            return match action {
                Some(level) => Routed::Control(level, Event::named(TERMINATE)),
                None => Routed::Deliver(Event::named(TERMINATE)),
            };
        }
        if self.held & (armed | fired) == 0 {
            self.held |= armed;
        }
        Routed::Deliver(key_event)
    }

    fn throttle_move(&mut self, event: Event, now: Instant) -> Routed {
        let Some(throttle) = self.options.mouse_move_throttle else {
            return Routed::Dropped;
        };
        match self.last_move {
            Some(last) if now.duration_since(last) < throttle => {
                self.pending_move = Some((last + throttle, event));
                Routed::Dropped
            }
            _ => {
                self.last_move = Some(now);
                self.pending_move = None;
                Routed::Deliver(event)
            }
        }
    }

    /// When a throttled `mouse_move` is waiting to be flushed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_move.as_ref().map(|(due, _)| *due)
    }

    /// Release the throttled `mouse_move` if its time has come.
    pub fn flush_due(&mut self, now: Instant) -> Option<Event> {
        match &self.pending_move {
            Some((due, _)) if *due <= now => {
                self.last_move = Some(now);
                self.pending_move.take().map(|(_, event)| event)
            }
            _ => None,
        }
    }

    fn file_drop(&mut self, paths: &[PathBuf]) -> Routed {
        let mut stored = Vec::new();
        for path in paths {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let data = match std::fs::read(path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "dropped file unreadable");
                    continue;
                }
            };
            match self.fs.write(&name, &data, false) {
                Ok(()) => stored.push(Value::String(name)),
                Err(e) => warn!(path = %path.display(), error = %e, "could not store dropped file"),
            }
        }
        if stored.is_empty() {
            return Routed::Dropped;
        }
        Routed::Deliver(Event::new("file_transfer", vec![Value::list(stored)]))
    }
}

fn mouse_args(first: i64, x: i32, y: i32, side: Option<String>) -> Vec<Value> {
    let mut args = vec![Value::Integer(first), x.into(), y.into()];
    if let Some(side) = side {
        args.push(side.into());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{MountTable, VirtualRegistry};

    fn router(options: RouterOptions) -> (tempfile::TempDir, EventRouter) {
        let tmp = tempfile::tempdir().unwrap();
        let fs = SandboxFs::new(
            Arc::new(Mutex::new(MountTable::new(tmp.path()))),
            Arc::new(VirtualRegistry::new()),
        );
        let mut monitors = BTreeMap::new();
        monitors.insert(7, "left".to_string());
        let router = EventRouter::new(
            0,
            1,
            Arc::new(Mutex::new(monitors)),
            Arc::new(Screen::new(1, 51, 19)),
            fs,
            Arc::new(HandlerRegistry::default()),
            options,
        );
        (tmp, router)
    }

    fn name(routed: &Routed) -> Option<&str> {
        match routed {
            Routed::Deliver(e) | Routed::Control(_, e) => Some(&e.name),
            Routed::Dropped => None,
        }
    }

    #[test]
    fn held_ctrl_t_terminates_on_repeat() {
        let (_tmp, mut r) = router(RouterOptions::default());
        let now = Instant::now();
        let first = r.translate(PlatformEvent::KeyDown { key: keys::T, repeat: false, ctrl: true }, now);
        assert_eq!(name(&first), Some("key"));
        let second = r.translate(PlatformEvent::KeyDown { key: keys::T, repeat: true, ctrl: true }, now);
        assert_eq!(second, Routed::Deliver(Event::named(TERMINATE)));
        let third = r.translate(PlatformEvent::KeyDown { key: keys::T, repeat: true, ctrl: true }, now);
        assert_eq!(name(&third), Some("key"));
    }

    #[test]
    fn held_ctrl_r_and_ctrl_s_change_run_level() {
        let (_tmp, mut r) = router(RouterOptions::default());
        let now = Instant::now();
        r.translate(PlatformEvent::KeyDown { key: keys::R, repeat: false, ctrl: true }, now);
        let reboot = r.translate(PlatformEvent::KeyDown { key: keys::R, repeat: true, ctrl: true }, now);
        assert_eq!(reboot, Routed::Control(RunLevel::Rebooting, Event::named(TERMINATE)));

        r.translate(PlatformEvent::KeyUp { key: keys::R }, now);
        r.translate(PlatformEvent::KeyDown { key: keys::S, repeat: false, ctrl: true }, now);
        r.translate(PlatformEvent::KeyUp { key: keys::S }, now);
        let after_release = r.translate(PlatformEvent::KeyDown { key: keys::S, repeat: true, ctrl: true }, now);
        assert_eq!(name(&after_release), Some("key"));
    }

    #[test]
    fn monitor_clicks_become_touches() {
        let (_tmp, mut r) = router(RouterOptions::default());
        let now = Instant::now();
        let touch = r.translate(PlatformEvent::MouseDown { window: 7, button: 1, x: 3, y: 4 }, now);
        assert_eq!(
            touch,
            Routed::Deliver(Event::new("monitor_touch", vec!["left".into(), 3.into(), 4.into()]))
        );
        let click = r.translate(PlatformEvent::MouseDown { window: 1, button: 2, x: 3, y: 4 }, now);
        assert_eq!(
            click,
            Routed::Deliver(Event::new("mouse_click", vec![2.into(), 3.into(), 4.into()]))
        );
    }

    #[test]
    fn repeated_drags_are_deduplicated() {
        let (_tmp, mut r) = router(RouterOptions::default());
        let now = Instant::now();
        let drag = PlatformEvent::MouseMove { window: 1, button: Some(1), x: 5, y: 5 };
        assert_eq!(name(&r.translate(drag.clone(), now)), Some("mouse_drag"));
        assert_eq!(r.translate(drag, now), Routed::Dropped);
    }

    #[test]
    fn mouse_moves_are_throttled_then_flushed() {
        let (_tmp, mut r) = router(RouterOptions::default());
        let t0 = Instant::now();
        let mv = |x| PlatformEvent::MouseMove { window: 1, button: None, x, y: 1 };
        assert_eq!(name(&r.translate(mv(1), t0)), Some("mouse_move"));
        assert_eq!(r.translate(mv(2), t0 + Duration::from_millis(10)), Routed::Dropped);
        assert_eq!(r.translate(mv(3), t0 + Duration::from_millis(20)), Routed::Dropped);
        let due = r.next_deadline().unwrap();
        assert!(r.flush_due(due - Duration::from_millis(1)).is_none());
        let flushed = r.flush_due(due).unwrap();
        assert_eq!(flushed.args[1], Value::Integer(3));
        assert!(r.next_deadline().is_none());
    }

    #[test]
    fn disabled_throttle_drops_moves() {
        let options = RouterOptions { mouse_move_throttle: None, ..RouterOptions::default() };
        let (_tmp, mut r) = router(options);
        let mv = PlatformEvent::MouseMove { window: 1, button: None, x: 1, y: 1 };
        assert_eq!(r.translate(mv, Instant::now()), Routed::Dropped);
    }

    #[test]
    fn resize_updates_screen() {
        let (_tmp, mut r) = router(RouterOptions::default());
        let routed = r.translate(PlatformEvent::Resize { window: 1, width: 30, height: 10 }, Instant::now());
        assert_eq!(routed, Routed::Deliver(Event::named("term_resize")));
        assert_eq!(r.screen.lock().width, 30);
    }

    #[test]
    fn interceptors_consume_events() {
        let (_tmp, mut r) = router(RouterOptions::default());
        r.handlers
            .register(PlatformEventKind::Paste, Arc::new(|_: &PlatformEvent, _: ComputerId| true));
        assert_eq!(r.route(PlatformEvent::Paste("x".into())), Routed::Dropped);
        assert_eq!(name(&r.route(PlatformEvent::Text("ab".into()))), Some("char"));
    }

    #[test]
    fn dropped_files_land_in_the_root() {
        let (tmp, mut r) = router(RouterOptions::default());
        let outside = tempfile::tempdir().unwrap();
        let src = outside.path().join("hello.lua");
        std::fs::write(&src, "print(1)").unwrap();
        let routed = r.translate(PlatformEvent::FileDrop { paths: vec![src] }, Instant::now());
        assert_eq!(name(&routed), Some("file_transfer"));
        assert_eq!(std::fs::read(tmp.path().join("hello.lua")).unwrap(), b"print(1)");
    }

    #[test]
    fn key_names_map_to_codes() {
        assert_eq!(keys::code("a"), Some(30));
        assert_eq!(keys::code("T"), Some(keys::T));
        assert_eq!(keys::code("1"), Some(2));
        assert_eq!(keys::code("0"), Some(11));
        assert_eq!(keys::code("F1"), Some(59));
        assert_eq!(keys::code("F12"), Some(88));
        assert_eq!(keys::code("up"), Some(200));
        assert_eq!(keys::code("nonsense"), None);
    }
}
