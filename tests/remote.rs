//! Remote terminal tests against live computers.
//!
//! Tested in this file:
//! - raw frames rendered from a computer's screen rebuild it on a mirror
//! - a corrupted frame changes neither the mirror nor the computer
//! - raw and line-protocol input reach the computer owning the window
//! - resize requests beyond the terminal limit are dropped

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Record, Step, TestHost, event_names, records, wait_for};
use vcomputer::config::HostConfig;
use vcomputer::event::Event;
use vcomputer::remote::raw::{Frame, FrameCodec, Message};
use vcomputer::remote::session::render_all;
use vcomputer::remote::{LineHost, ProtocolError, RawHost, RemoteHost, WindowMirror, read_input};
use vcomputer::value::Value;

const JOIN: Duration = Duration::from_secs(10);

fn corrupt(line: &str) -> String {
    let mut line = line.trim_end().to_string();
    let last = line.pop().unwrap();
    line.push(if last == '0' { '1' } else { '0' });
    line
}

#[test]
fn mirrors_follow_a_live_screen_and_ignore_corruption() {
    let host = TestHost::new(HostConfig { default_width: 10, default_height: 3, ..HostConfig::default() });
    let (handle, log) = host.start(
        0,
        vec![
            Step::Call("term", "write", vec![Value::str("hello")]),
            Step::Call("os", "queueEvent", vec![Value::str("written")]),
            Step::Pull(None),
            Step::Pull(Some("more")),
            Step::Call("term", "write", vec![Value::str(" world")]),
            Step::Call("os", "queueEvent", vec![Value::str("written")]),
            Step::Pull(None),
            Step::Pull(Some("done")),
        ],
    );
    assert!(wait_for(JOIN, || event_names(&log) == ["written"]));

    let raw = RawHost::new(Vec::new(), false);
    assert_eq!(render_all(&raw, &host.ctx.computers).unwrap(), 1);
    assert_eq!(render_all(&raw, &host.ctx.computers).unwrap(), 0, "unchanged screens are not resent");

    handle.queue_named(Event::named("more"));
    assert!(wait_for(JOIN, || event_names(&log).len() == 3));
    let screen = handle.screen().unwrap();
    assert!(raw.render(&screen).unwrap());

    let text = String::from_utf8(raw.into_inner()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);

    let mut mirror = WindowMirror::default();
    mirror.receive(lines[0]).unwrap();
    assert_eq!(mirror.window(0).unwrap().text(), "hello     \n          \n          ");
    let before = mirror.window(0).unwrap().frame.clone();

    let err = mirror.receive(&corrupt(lines[1])).unwrap_err();
    assert!(matches!(err, ProtocolError::Checksum { .. }));
    assert_eq!(mirror.window(0).unwrap().frame, before);

    mirror.receive(lines[1]).unwrap();
    assert!(mirror.window(0).unwrap().text().starts_with("hello worl"));
    assert_eq!(mirror.window(0).unwrap().frame.cells, screen.snapshot().cells);

    handle.queue_named(Event::named("done"));
    assert!(handle.join(Some(JOIN)));
}

#[test]
fn raw_input_reaches_the_computer_owning_the_window() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(0, vec![Step::Pull(None), Step::Pull(None)]);
    assert_eq!(handle.window(), Some(0));

    let client = FrameCodec::default();
    let key = client
        .encode(&Frame::new(0, Message::Key { key: 28, ch: 0, up: false, held: false, ctrl: false }))
        .unwrap();
    let paste = client
        .encode(&Frame::new(0, Message::Event(Event::new("paste", vec![Value::str("hi")]))))
        .unwrap();
    let stray = client
        .encode(&Frame::new(7, Message::Event(Event::named("elsewhere"))))
        .unwrap();
    let input = format!("{}\n{key}!CPCzzzz\n{stray}{paste}", corrupt(&paste));

    let session = Arc::new(RawHost::new(Vec::new(), false));
    host.runtime()
        .block_on(read_input(input.as_bytes(), session, Arc::clone(&host.ctx.computers)))
        .unwrap();

    assert!(handle.join(Some(JOIN)));
    assert_eq!(
        records(&log),
        vec![
            Record::Event(vec![Value::str("key"), Value::Integer(28), Value::Bool(false)]),
            Record::Event(vec![Value::str("paste"), Value::str("hi")]),
        ]
    );
}

#[test]
fn line_protocol_events_and_close() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(0, vec![Step::Pull(Some("char")), Step::Pull(None)]);

    let session = Arc::new(LineHost::new(Vec::new(), &[]));
    let input: &[u8] = b"SP:;-ccpcTerm-\nEV:;\"char\", \"a\"\nEV:;broken\n";
    host.runtime()
        .block_on(read_input(input, Arc::clone(&session), Arc::clone(&host.ctx.computers)))
        .unwrap();
    assert!(wait_for(JOIN, || !records(&log).is_empty()));
    assert_eq!(records(&log), vec![Record::Event(vec![Value::str("char"), Value::str("a")])]);

    let close: &[u8] = b"SC:;bye\nEV:;\"late\"\n";
    host.runtime()
        .block_on(read_input(close, Arc::clone(&session), Arc::clone(&host.ctx.computers)))
        .unwrap();
    assert!(handle.join(Some(JOIN)));
    assert_eq!(records(&log).len(), 1);

    session.open_window(0, 51, 19, "Computer 0").unwrap();
    let session = Arc::try_unwrap(session).ok().unwrap();
    assert_eq!(String::from_utf8(session.into_inner()).unwrap(), "TN:0;Computer 0\n");
}

#[test]
fn oversized_remote_resize_is_dropped() {
    let host = TestHost::new(HostConfig::default());
    let (handle, log) = host.start(0, vec![Step::Pull(None)]);
    let screen = handle.screen().unwrap();

    let session = Arc::new(LineHost::new(Vec::new(), &[]));
    let input: &[u8] = b"TR:0;100000,100000\nTR:0;4294967295,1\nTR:0;40,12\n";
    host.runtime()
        .block_on(read_input(input, session, Arc::clone(&host.ctx.computers)))
        .unwrap();

    assert!(handle.join(Some(JOIN)));
    assert_eq!(event_names(&log), ["term_resize"]);
    let frame = screen.snapshot();
    assert_eq!((frame.width, frame.height), (40, 12));
    assert_eq!(frame.cells.len(), 40 * 12);
}
