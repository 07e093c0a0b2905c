//! Call-count and time profiler driven by call/return hooks.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::engine::FrameInfo;
use crate::value::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProfileEntry {
    pub count: u64,
    #[serde(with = "secs")]
    pub time: Duration,
}

mod secs {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[derive(Debug, Default)]
pub struct Profiler {
    enabled: bool,
    /// source → function → totals
    entries: BTreeMap<String, BTreeMap<String, ProfileEntry>>,
    stack: Vec<(String, String, Instant)>,
}

fn function_name(frame: &FrameInfo) -> String {
    match (&frame.name, frame.line_defined) {
        (Some(name), _) => name.clone(),
        (None, Some(line)) => format!("<anonymous:{line}>"),
        (None, None) => "?".to_string(),
    }
}

impl Profiler {
    /// Turning profiling on clears earlier results.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.entries.clear();
        }
        self.enabled = enabled;
        self.stack.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn on_call(&mut self, frame: &FrameInfo, now: Instant) {
        if !self.enabled {
            return;
        }
        let name = function_name(frame);
        self.entries
            .entry(frame.source.clone())
            .or_default()
            .entry(name.clone())
            .or_default()
            .count += 1;
        self.stack.push((frame.source.clone(), name, now));
    }

    pub fn on_return(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }
        if let Some((source, name, started)) = self.stack.pop() {
            if let Some(entry) = self.entries.get_mut(&source).and_then(|f| f.get_mut(&name)) {
                entry.time += now.saturating_duration_since(started);
            }
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, BTreeMap<String, ProfileEntry>> {
        &self.entries
    }

    /// `{source = {func = {count = n, time = seconds}}}` for the guest.
    pub fn report(&self) -> Value {
        Value::Table(
            self.entries
                .iter()
                .map(|(source, funcs)| {
                    let funcs = funcs
                        .iter()
                        .map(|(name, e)| {
                            let entry = Value::Table(vec![
                                ("count".into(), Value::Integer(e.count as i64)),
                                ("time".into(), Value::Number(e.time.as_secs_f64())),
                            ]);
                            (Value::from(name.as_str()), entry)
                        })
                        .collect();
                    (Value::from(source.as_str()), Value::Table(funcs))
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &str) -> FrameInfo {
        FrameInfo {
            source: "@/a.lua".into(),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    #[test]
    fn counts_calls_and_accumulates_time() {
        let mut p = Profiler::default();
        let t0 = Instant::now();
        p.on_call(&frame("f"), t0);
        p.set_enabled(true);
        p.on_call(&frame("f"), t0);
        p.on_return(t0 + Duration::from_millis(5));
        p.on_call(&frame("f"), t0);
        p.on_return(t0 + Duration::from_millis(5));

        let entry = p.entries()["@/a.lua"]["f"];
        assert_eq!(entry.count, 2);
        assert_eq!(entry.time, Duration::from_millis(10));
    }

    #[test]
    fn re_enabling_starts_fresh() {
        let mut p = Profiler::default();
        p.set_enabled(true);
        p.on_call(&frame("g"), Instant::now());
        p.set_enabled(false);
        assert!(!p.entries().is_empty());
        p.set_enabled(true);
        assert!(p.entries().is_empty());
    }
}
