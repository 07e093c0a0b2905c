//! Named guest events and the per-computer inbox.
//!
//! Producers on any thread push either a deferred [`EventProvider`] or a raw
//! [`PlatformEvent`](crate::router::PlatformEvent). The computer thread drains
//! the inbox in arrival order, so a producer's events are never reordered.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::router::PlatformEvent;
use crate::value::Value;

/// Name of the event that always bypasses a pull filter.
pub const TERMINATE: &str = "terminate";

/// A named event ready for delivery to the guest.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self { name: name.into(), args }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Whether a pull with `filter` accepts this event.
    pub fn matches(&self, filter: Option<&str>) -> bool {
        match filter {
            None | Some("") => true,
            Some(f) => self.name == f || self.name == TERMINATE,
        }
    }

    /// Flatten into the argument list handed to a resuming engine.
    pub fn into_resume_args(self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.args.len() + 1);
        out.push(Value::String(self.name));
        out.extend(self.args);
        out
    }
}

/// Deferred event construction, run exactly once on the consuming thread.
///
/// Pushes arguments into the vector and returns the event name, or `None`
/// to drop the event.
pub type EventProvider = Box<dyn FnOnce(&mut Vec<Value>) -> Option<String> + Send>;

/// Wrap an already-built event as a provider.
pub fn ready(event: Event) -> EventProvider {
    Box::new(move |args| {
        args.extend(event.args);
        Some(event.name)
    })
}

pub(crate) enum Inbound {
    Provider(EventProvider),
    Platform(PlatformEvent),
}

#[derive(Default)]
struct InboxState {
    items: VecDeque<Inbound>,
    closed: bool,
}

/// Thread-safe FIFO feeding one computer's event loop.
#[derive(Default)]
pub struct Inbox {
    state: Mutex<InboxState>,
    wake: Condvar,
}

impl Inbox {
    pub(crate) fn push(&self, item: Inbound) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.wake.notify_all();
        true
    }

    pub(crate) fn pop(&self) -> Option<Inbound> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .pop_front()
    }

    /// Block up to `timeout` until something is queued or the inbox is poked.
    pub(crate) fn wait(&self, timeout: Duration) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.items.is_empty() && !state.closed {
            let _ = self
                .wake
                .wait_timeout(state, timeout)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Wake a blocked consumer so it re-checks liveness flags.
    pub fn poke(&self) {
        self.wake.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further events and drop anything pending.
    pub(crate) fn close(&self) {
        let dropped = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
            std::mem::take(&mut state.items)
        };
        drop(dropped);
        self.wake.notify_all();
    }

    /// Accept events again after a reboot.
    pub(crate) fn reopen(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = false;
        state.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_bypasses_filters() {
        let ev = Event::named(TERMINATE);
        assert!(ev.matches(Some("key")));
        assert!(Event::named("char").matches(None));
        assert!(Event::named("char").matches(Some("")));
        assert!(!Event::named("char").matches(Some("key")));
    }

    #[test]
    fn ready_provider_yields_name_and_args() {
        let provider = ready(Event::new("timer", vec![Value::Integer(3)]));
        let mut args = Vec::new();
        assert_eq!(provider(&mut args).as_deref(), Some("timer"));
        assert_eq!(args, vec![Value::Integer(3)]);
    }

    #[test]
    fn closed_inbox_rejects_pushes() {
        let inbox = Inbox::default();
        assert!(inbox.push(Inbound::Provider(ready(Event::named("a")))));
        inbox.close();
        assert!(inbox.is_empty());
        assert!(!inbox.push(Inbound::Provider(ready(Event::named("b")))));
        inbox.reopen();
        assert!(inbox.push(Inbound::Provider(ready(Event::named("c")))));
        assert_eq!(inbox.len(), 1);
    }
}
