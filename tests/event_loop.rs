//! Computer event loop tests, driven by a scripted guest.
//!
//! Tested in this file:
//! - FIFO delivery with several producer threads
//! - event filters, `terminate` bypassing them, and filtered-out events
//!   being discarded
//! - guest API calls queueing events for the same computer
//! - platform input routed to named events
//! - the no-yield watchdog raising inside a runaway guest
//! - reboot running a fresh engine
//! - hostile cursor coordinates and a panicking host function ending only
//!   that computer

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{Record, Step, TestHost, event_names, records, wait_for};
use vcomputer::api::{ApiError, Library};
use vcomputer::computer::RunLevel;
use vcomputer::config::HostConfig;
use vcomputer::event::Event;
use vcomputer::governor::TOO_LONG;
use vcomputer::router::PlatformEvent;
use vcomputer::value::Value;

const JOIN: Duration = Duration::from_secs(10);

fn pulls(n: usize) -> Vec<Step> {
    vec![Step::Pull(None); n]
}

// ---------------------------------------------------------------------------
// Ordering and filters
// ---------------------------------------------------------------------------

#[test]
fn events_from_many_producers_arrive_in_per_producer_order() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(0, pulls(40));

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let handle = handle.clone();
            std::thread::spawn(move || {
                for n in 0..10 {
                    assert!(handle.queue_named(Event::new(format!("p{p}"), vec![Value::Integer(n)])));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(handle.join(Some(JOIN)), "guest should finish after 40 events");
    let events: Vec<Vec<Value>> = records(&log)
        .into_iter()
        .filter_map(|r| match r {
            Record::Event(args) => Some(args),
            _ => None,
        })
        .collect();
    assert_eq!(events.len(), 40);

    let unique: HashSet<String> = events.iter().map(|e| format!("{e:?}")).collect();
    assert_eq!(unique.len(), 40, "no event is delivered twice");

    for p in 0..4 {
        let name = format!("p{p}");
        let seq: Vec<i64> = events
            .iter()
            .filter(|e| e[0].as_str() == Some(name.as_str()))
            .map(|e| e[1].as_i64().unwrap())
            .collect();
        assert_eq!(seq, (0..10i64).collect::<Vec<_>>());
    }
}

#[test]
fn filtered_pulls_discard_other_events() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(0, vec![Step::Pull(Some("key")), Step::Pull(None)]);

    handle.queue_named(Event::named("mouse_click"));
    handle.queue_named(Event::new("key", vec![Value::Integer(28)]));
    assert!(wait_for(JOIN, || event_names(&log).len() == 1));
    handle.queue_named(Event::named("char"));

    assert!(handle.join(Some(JOIN)));
    assert_eq!(event_names(&log), ["key", "char"]);
}

#[test]
fn terminate_bypasses_the_filter() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(0, vec![Step::Pull(Some("timer"))]);

    handle.queue_named(Event::named("terminate"));
    assert!(handle.join(Some(JOIN)));
    assert_eq!(event_names(&log), ["terminate"]);
}

#[test]
fn a_filtered_pull_keeps_waiting_for_its_event() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(0, vec![Step::Pull(Some("key"))]);

    std::thread::sleep(Duration::from_millis(150));
    assert!(records(&log).is_empty());
    assert_eq!(handle.run_level(), Some(RunLevel::Running));

    handle.queue_named(Event::named("key"));
    assert!(handle.join(Some(JOIN)));
    assert_eq!(event_names(&log), ["key"]);
}

// ---------------------------------------------------------------------------
// Guest API and platform input
// ---------------------------------------------------------------------------

#[test]
fn guest_queued_events_come_back_to_the_guest() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(
        0,
        vec![
            Step::Call("os", "queueEvent", vec![Value::str("hello"), Value::Integer(1)]),
            Step::Pull(None),
        ],
    );

    assert!(handle.join(Some(JOIN)));
    assert_eq!(
        records(&log),
        vec![
            Record::Call(Ok(Vec::new())),
            Record::Event(vec![Value::str("hello"), Value::Integer(1)]),
        ]
    );
}

#[test]
fn platform_keys_become_key_events() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(0, pulls(2));

    handle.push_platform(PlatformEvent::KeyDown { key: 30, repeat: false, ctrl: false });
    handle.push_platform(PlatformEvent::Text("a".into()));

    assert!(handle.join(Some(JOIN)));
    assert_eq!(
        records(&log),
        vec![
            Record::Event(vec![Value::str("key"), Value::Integer(30), Value::Bool(false)]),
            Record::Event(vec![Value::str("char"), Value::str("a")]),
        ]
    );
}

#[test]
fn quit_stops_a_waiting_computer() {
    let host = TestHost::new(HostConfig::default());
    let (handle, _log) = host.start(0, pulls(1));

    handle.push_platform(PlatformEvent::Quit);
    assert!(handle.join(Some(JOIN)));
    assert!(!handle.is_alive());
    assert!(host.ctx.computers.is_empty());
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

fn quick_timeout() -> HostConfig {
    HostConfig { abort_timeout_ms: 200, ..HostConfig::default() }
}

#[test]
fn a_runaway_guest_gets_a_too_long_error() {
    let host = TestHost::new(quick_timeout());
    let (handle, log) = host.start(0, vec![Step::Hog(Duration::from_secs(5))]);
    let screen = handle.screen().unwrap();

    assert!(handle.join(Some(JOIN)));
    assert_eq!(records(&log), vec![Record::Raised(TOO_LONG.to_string())]);

    let frame = screen.snapshot();
    let text: String = frame.cells.iter().map(|c| c.glyph as char).collect();
    assert!(text.contains(TOO_LONG), "failure is printed on the terminal");
}

#[test]
fn the_watchdog_raises_again_while_the_guest_keeps_running() {
    let host = TestHost::new(quick_timeout());
    let (handle, log) =
        host.start(0, vec![Step::Spin { budget: Duration::from_secs(5), catches: 2 }]);

    assert!(handle.join(Some(JOIN)));
    let raised = records(&log).into_iter().filter(|r| matches!(r, Record::Raised(_))).count();
    assert_eq!(raised, 2);
}

#[test]
fn yielding_in_time_never_raises() {
    let host = TestHost::new(quick_timeout());
    let mut steps = Vec::new();
    for _ in 0..3 {
        steps.push(Step::Spin { budget: Duration::from_millis(50), catches: 1 });
        steps.push(Step::Call("os", "queueEvent", vec![Value::str("tick")]));
        steps.push(Step::Pull(None));
    }
    let (handle, log) = host.start(0, steps);

    assert!(handle.join(Some(JOIN)));
    assert!(!records(&log).iter().any(|r| matches!(r, Record::Raised(_))));
    assert_eq!(event_names(&log), ["tick", "tick", "tick"]);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn reboot_boots_a_fresh_engine() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(
        3,
        vec![Step::Call("os", "getComputerID", Vec::new()), Step::Pull(Some("never"))],
    );

    assert!(wait_for(JOIN, || records(&log).len() == 1));
    assert!(handle.reboot());
    assert!(wait_for(JOIN, || records(&log).len() == 2));
    assert!(handle.is_alive());

    let calls: Vec<_> = records(&log)
        .into_iter()
        .filter(|r| matches!(r, Record::Call(Ok(v)) if v.first().and_then(Value::as_i64) == Some(3)))
        .collect();
    assert_eq!(calls.len(), 2);

    assert!(handle.shutdown());
    assert!(handle.join(Some(JOIN)));
}

// ---------------------------------------------------------------------------
// Hostile input
// ---------------------------------------------------------------------------

#[test]
fn extreme_cursor_positions_are_refused_or_clamped() {
    let host = TestHost::new(HostConfig::default());
    let set = |x: Value| Step::Call("term", "setCursorPos", vec![x, Value::Integer(1)]);
    let get = || Step::Call("term", "getCursorPos", Vec::new());
    let (handle, log) = host.start(
        0,
        vec![
            set(Value::Number(-1e300)),
            set(Value::Integer(i64::MIN)),
            get(),
            set(Value::Number(3e9)),
            get(),
            Step::Call("term", "write", vec![Value::str("abc")]),
            get(),
        ],
    );

    assert!(handle.join(Some(JOIN)), "computer must finish normally");
    let results: Vec<_> = records(&log)
        .into_iter()
        .map(|r| match r {
            Record::Call(result) => result,
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    assert!(results[0].is_err(), "-1e300 is not an integer position");
    assert_eq!(results[1], Ok(Vec::new()));
    assert_eq!(results[2], Ok(vec![Value::Integer(i32::MIN as i64 + 1), Value::Integer(1)]));
    assert_eq!(results[3], Ok(Vec::new()));
    assert_eq!(results[4], Ok(vec![Value::Integer(i32::MAX as i64), Value::Integer(1)]));
    assert_eq!(results[5], Ok(Vec::new()));
    assert_eq!(results[6], results[4]);
}

#[test]
fn oversized_platform_resizes_are_ignored() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(0, pulls(1));
    let screen = handle.screen().unwrap();
    let window = handle.window().unwrap();

    handle.push_platform(PlatformEvent::Resize { window, width: 100_000, height: 100_000 });
    handle.push_platform(PlatformEvent::Resize { window, width: 30, height: 10 });

    assert!(handle.join(Some(JOIN)));
    assert_eq!(event_names(&log), ["term_resize"]);
    let frame = screen.snapshot();
    assert_eq!((frame.width, frame.height), (30, 10));
}

#[test]
fn a_panicking_host_function_ends_only_its_computer() {
    let host = TestHost::new(HostConfig::default());
    let boom = Library::new("boom").function("now", |_args: &[Value]| -> Result<Vec<Value>, ApiError> {
        panic!("host function exploded")
    });
    let (builder, _log) = host.builder(0, vec![Step::Call("boom", "now", Vec::new()), Step::Pull(None)]);
    let crashed = builder.library(boom).start().unwrap();
    let (survivor, survivor_log) = host.start(1, pulls(1));

    assert!(crashed.join(Some(JOIN)), "join returns after the thread panics");
    assert!(!crashed.is_alive());
    assert!(survivor.is_alive());

    survivor.queue_named(Event::named("still_here"));
    assert!(survivor.join(Some(JOIN)));
    assert_eq!(event_names(&survivor_log), ["still_here"]);
    assert!(host.ctx.computers.is_empty());

    // The id is free again.
    let (again, _) = host.start(0, Vec::new());
    assert!(again.join(Some(JOIN)));
}
