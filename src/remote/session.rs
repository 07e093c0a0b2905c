//! Host-side sessions and input dispatch.
//!
//! A [`RemoteHost`] writes window lifecycle, messages and screen contents to
//! one client and decodes what the client sends back. [`read_input`] is the
//! receive loop; it hands every decoded [`RemoteInput`] to
//! [`dispatch_input`], which reaches computers only through the registry's
//! handles.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, info, warn};

use super::line::{self, CCPC_TERM, LineCode, LineMessage};
use super::raw::{
    FEATURE_BINARY_CHECKSUM, Frame, FrameCodec, MESSAGE_ERROR, MESSAGE_INFORMATION,
    MESSAGE_WARNING, Message, MouseKind, Snapshot, WindowChange,
};
use super::{MAX_LINE, ProtocolError};
use crate::computer::{ComputerHandle, ComputerId, ComputerRegistry, HeadlessUi, HostUi, MessageLevel, NotResponding};
use crate::event::Event;
use crate::router::PlatformEvent;
use crate::screen::{Screen, WindowId};

/// Input decoded from either protocol, addressed by window.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteInput {
    Key { window: WindowId, key: u8, ch: Option<char>, up: bool, held: bool, ctrl: bool },
    Mouse { window: WindowId, kind: MouseKind, button: u8, x: u32, y: u32 },
    Event { window: WindowId, event: Event },
    Resize { window: WindowId, width: u32, height: u32 },
    CloseWindow { window: WindowId },
    /// The client is going away; every computer is asked to quit.
    CloseConnection,
}

impl RemoteInput {
    /// Raw platform input equivalent to this message.
    fn platform_events(&self) -> Vec<PlatformEvent> {
        let coord = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        match *self {
            RemoteInput::Key { key, up: true, .. } => vec![PlatformEvent::KeyUp { key }],
            RemoteInput::Key { key, ch, held, ctrl, .. } => {
                let mut out = vec![PlatformEvent::KeyDown { key, repeat: held, ctrl }];
                if let Some(ch) = ch {
                    out.push(PlatformEvent::Text(ch.to_string()));
                }
                out
            }
            RemoteInput::Mouse { window, kind, button, x, y } => {
                let (x, y) = (coord(x), coord(y));
                vec![match kind {
                    MouseKind::Click => PlatformEvent::MouseDown { window, button, x, y },
                    MouseKind::Up => PlatformEvent::MouseUp { window, button, x, y },
                    MouseKind::Scroll => PlatformEvent::MouseWheel {
                        window,
                        direction: if button == 0 { -1 } else { 1 },
                        x,
                        y,
                    },
                    MouseKind::Drag => PlatformEvent::MouseMove { window, button: Some(button), x, y },
                }]
            }
            RemoteInput::Resize { window, width, height } => {
                vec![PlatformEvent::Resize { window, width, height }]
            }
            RemoteInput::CloseWindow { window } => vec![PlatformEvent::WindowClose { window }],
            RemoteInput::CloseConnection => vec![PlatformEvent::Quit],
            RemoteInput::Event { .. } => Vec::new(),
        }
    }

    fn window(&self) -> Option<WindowId> {
        match self {
            RemoteInput::Key { window, .. }
            | RemoteInput::Mouse { window, .. }
            | RemoteInput::Event { window, .. }
            | RemoteInput::Resize { window, .. }
            | RemoteInput::CloseWindow { window } => Some(*window),
            RemoteInput::CloseConnection => None,
        }
    }
}

/// Deliver `input` to every computer drawing into its window. Returns how
/// many computers accepted it.
pub fn dispatch_input(registry: &ComputerRegistry, input: RemoteInput) -> usize {
    let targets: Vec<ComputerHandle> = match input.window() {
        Some(window) => registry.by_window(window),
        None => registry.live(),
    };
    if targets.is_empty() {
        debug!(window = ?input.window(), "remote input for a window nobody owns; dropped");
        return 0;
    }
    match input {
        RemoteInput::Event { event, .. } => targets
            .iter()
            .filter(|computer| computer.queue_named(event.clone()))
            .count(),
        other => {
            let events = other.platform_events();
            targets
                .iter()
                .filter(|computer| events.iter().all(|e| computer.push_platform(e.clone())))
                .count()
        }
    }
}

/// Receive loop for one client connection.
///
/// Bad frames are logged and dropped. The loop ends when the client closes
/// the stream or sends a close message, and fails only when the stream
/// desyncs or the transport errors.
pub async fn read_input<R, H>(
    reader: R,
    host: Arc<H>,
    registry: Arc<ComputerRegistry>,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    H: RemoteHost + ?Sized,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = (&mut reader)
            .take(MAX_LINE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            info!("remote client disconnected");
            return Ok(());
        }
        if buf.len() > MAX_LINE && buf.last() != Some(&b'\n') {
            warn!(bytes = buf.len(), "remote input line too long; closing connection");
            return Err(ProtocolError::Desync);
        }
        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }
        match host.decode_input(&line) {
            Ok(Some(RemoteInput::CloseConnection)) => {
                let reached = dispatch_input(&registry, RemoteInput::CloseConnection);
                info!(computers = reached, "remote client closed the connection");
                return Ok(());
            }
            Ok(Some(input)) => {
                dispatch_input(&registry, input);
            }
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "dropping remote input"),
        }
    }
}

/// Send every changed main screen. Returns how many frames went out.
pub fn render_all<H: RemoteHost + ?Sized>(host: &H, registry: &ComputerRegistry) -> Result<usize, ProtocolError> {
    let mut sent = 0;
    for computer in registry.live() {
        let Some(screen) = computer.screen() else {
            continue;
        };
        if host.render(&screen)? {
            sent += 1;
        }
    }
    Ok(sent)
}

// ---------------------------------------------------------------------------
// Hosts
// ---------------------------------------------------------------------------

/// Server side of one remote connection.
pub trait RemoteHost: Send + Sync {
    fn open_window(&self, window: WindowId, width: u32, height: u32, title: &str) -> Result<(), ProtocolError>;
    fn close_window(&self, window: WindowId) -> Result<(), ProtocolError>;
    fn set_title(&self, window: WindowId, title: &str) -> Result<(), ProtocolError>;
    fn show_message(
        &self,
        window: Option<WindowId>,
        level: MessageLevel,
        title: &str,
        message: &str,
    ) -> Result<(), ProtocolError>;

    /// Send `screen` if it changed since the last call. Returns whether a
    /// frame went out.
    fn render(&self, screen: &Screen) -> Result<bool, ProtocolError>;

    /// Decode one received line. `Ok(None)` means the session consumed it.
    fn decode_input(&self, line: &str) -> Result<Option<RemoteInput>, ProtocolError>;
}

fn wire_window(window: WindowId) -> Result<u8, ProtocolError> {
    u8::try_from(window).map_err(|_| ProtocolError::Unencodable(format!("window id {window}")))
}

fn write_line<W: Write>(out: &Mutex<W>, line: &str) -> Result<(), ProtocolError> {
    let mut out = out.lock().unwrap_or_else(|e| e.into_inner());
    out.write_all(line.as_bytes())?;
    out.flush()?;
    Ok(())
}

/// Binary-frame session.
pub struct RawHost<W> {
    out: Mutex<W>,
    codec: FrameCodec,
    windows: Mutex<BTreeMap<WindowId, WindowChange>>,
}

impl<W: Write + Send> RawHost<W> {
    pub fn new(out: W, binary_checksum: bool) -> Self {
        Self {
            out: Mutex::new(out),
            codec: FrameCodec::new(binary_checksum),
            windows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    pub fn send(&self, window: WindowId, message: Message) -> Result<(), ProtocolError> {
        let line = self.codec.encode(&Frame::new(wire_window(window)?, message))?;
        write_line(&self.out, &line)
    }

    /// Tell the client which optional features this host speaks.
    pub fn advertise_features(&self, flags: u16) -> Result<(), ProtocolError> {
        self.send(0, Message::Features { flags, extended: 0 })
    }

    fn send_window(&self, window: WindowId, change: WindowChange) -> Result<(), ProtocolError> {
        self.send(window, Message::Window(change.clone()))?;
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        if change.closing {
            windows.remove(&window);
        } else {
            windows.insert(window, change);
        }
        Ok(())
    }
}

impl<W: Write + Send> RemoteHost for RawHost<W> {
    fn open_window(&self, window: WindowId, width: u32, height: u32, title: &str) -> Result<(), ProtocolError> {
        let dim = |v: u32| u16::try_from(v).map_err(|_| ProtocolError::Unencodable(format!("size {v}")));
        self.send_window(
            window,
            WindowChange { closing: false, width: dim(width)?, height: dim(height)?, title: title.to_string() },
        )
    }

    fn close_window(&self, window: WindowId) -> Result<(), ProtocolError> {
        self.send_window(
            window,
            WindowChange { closing: true, width: 0, height: 0, title: String::new() },
        )
    }

    fn set_title(&self, window: WindowId, title: &str) -> Result<(), ProtocolError> {
        let current = self
            .windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&window)
            .cloned();
        let change = match current {
            Some(change) => WindowChange { title: title.to_string(), ..change },
            None => WindowChange { closing: false, width: 0, height: 0, title: title.to_string() },
        };
        self.send_window(window, change)
    }

    fn show_message(
        &self,
        window: Option<WindowId>,
        level: MessageLevel,
        title: &str,
        message: &str,
    ) -> Result<(), ProtocolError> {
        let flags = match level {
            MessageLevel::Info => MESSAGE_INFORMATION,
            MessageLevel::Warning => MESSAGE_WARNING,
            MessageLevel::Error => MESSAGE_ERROR,
        };
        self.send(
            window.unwrap_or(0),
            Message::Message { flags, title: title.to_string(), text: message.to_string() },
        )
    }

    fn render(&self, screen: &Screen) -> Result<bool, ProtocolError> {
        let Some(frame) = screen.take_changed() else {
            return Ok(false);
        };
        self.send(screen.window(), Message::Terminal(Snapshot::capture(&frame)?))?;
        Ok(true)
    }

    fn decode_input(&self, line: &str) -> Result<Option<RemoteInput>, ProtocolError> {
        let frame = self.codec.decode(line)?;
        let window = WindowId::from(frame.window);
        Ok(match frame.message {
            Message::Key { key, ch, up, held, ctrl } => Some(RemoteInput::Key {
                window,
                key,
                ch: (ch != 0).then_some(ch as char),
                up,
                held,
                ctrl,
            }),
            Message::Mouse { kind, button, x, y } => Some(RemoteInput::Mouse { window, kind, button, x, y }),
            Message::Event(event) => Some(RemoteInput::Event { window, event }),
            Message::Window(change) if change.closing => Some(RemoteInput::CloseWindow { window }),
            Message::Window(change) => Some(RemoteInput::Resize {
                window,
                width: change.width.into(),
                height: change.height.into(),
            }),
            Message::Features { flags, .. } => {
                let binary = flags & FEATURE_BINARY_CHECKSUM != 0;
                self.codec.set_binary_checksum(binary);
                info!(flags, binary_checksum = binary, "remote client features");
                None
            }
            Message::Terminal(_) | Message::Message { .. } => {
                debug!(window, "client sent a host-bound frame; ignored");
                None
            }
        })
    }
}

/// Line-protocol session.
///
/// Window lifecycle messages are only sent once the client has advertised
/// the `ccpcTerm` extension; global messages always go out.
pub struct LineHost<W> {
    out: Mutex<W>,
    features: Vec<String>,
    extensions: Mutex<BTreeSet<String>>,
}

impl<W: Write + Send> LineHost<W> {
    pub fn new(out: W, features: &[String]) -> Self {
        let mut advertised = vec![CCPC_TERM.to_string()];
        advertised.extend(features.iter().filter(|f| f.as_str() != CCPC_TERM).cloned());
        Self {
            out: Mutex::new(out),
            features: advertised,
            extensions: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    /// Send the feature advertisement. Done once, at connection start.
    pub fn handshake(&self) -> Result<(), ProtocolError> {
        let payload = line::feature_payload(self.features.iter().map(String::as_str));
        self.send(&LineMessage::new(LineCode::Features, None, payload))
    }

    /// Tell the client the host is going away.
    pub fn close(&self, message: &str) -> Result<(), ProtocolError> {
        self.send(&LineMessage::new(LineCode::Shutdown, None, message))
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    fn send(&self, message: &LineMessage) -> Result<(), ProtocolError> {
        write_line(&self.out, &message.encode())
    }

    fn send_window(&self, code: LineCode, window: WindowId, payload: String) -> Result<(), ProtocolError> {
        if !self.has_extension(CCPC_TERM) {
            return Ok(());
        }
        self.send(&LineMessage::new(code, Some(window), payload))
    }
}

impl<W: Write + Send> RemoteHost for LineHost<W> {
    fn open_window(&self, window: WindowId, _width: u32, _height: u32, title: &str) -> Result<(), ProtocolError> {
        self.send_window(LineCode::Open, window, title.to_string())
    }

    fn close_window(&self, window: WindowId) -> Result<(), ProtocolError> {
        self.send_window(LineCode::Close, window, String::new())
    }

    fn set_title(&self, window: WindowId, title: &str) -> Result<(), ProtocolError> {
        self.send_window(LineCode::Title, window, title.to_string())
    }

    fn show_message(
        &self,
        window: Option<WindowId>,
        _level: MessageLevel,
        title: &str,
        message: &str,
    ) -> Result<(), ProtocolError> {
        let payload = line::alert_payload(title, message);
        match window {
            Some(window) => self.send_window(LineCode::Alert, window, payload),
            None => self.send(&LineMessage::new(LineCode::Alert, None, payload)),
        }
    }

    /// The line protocol carries no screen contents.
    fn render(&self, _screen: &Screen) -> Result<bool, ProtocolError> {
        Ok(false)
    }

    fn decode_input(&self, text: &str) -> Result<Option<RemoteInput>, ProtocolError> {
        let message = LineMessage::parse(text)?;
        let window = message.target();
        Ok(match message.code {
            LineCode::Features => {
                let features = line::parse_features(&message.payload);
                info!(?features, "remote client extensions");
                self.extensions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend(features);
                None
            }
            LineCode::Event => Some(RemoteInput::Event { window, event: line::parse_event(&message.payload)? }),
            LineCode::Resize => {
                let (width, height) = line::parse_resize(&message.payload)?;
                Some(RemoteInput::Resize { window, width, height })
            }
            LineCode::Close => Some(RemoteInput::CloseWindow { window }),
            LineCode::Shutdown => Some(RemoteInput::CloseConnection),
            LineCode::Open | LineCode::Title | LineCode::Alert => {
                debug!(code = message.code.as_str(), "client sent a host-bound message; ignored");
                None
            }
        })
    }
}

/// [`HostUi`] that shows notices on a remote client.
///
/// A remote client cannot answer prompts, so decisions fall back to
/// [`HeadlessUi`].
pub struct RemoteUi {
    host: Arc<dyn RemoteHost>,
}

impl RemoteUi {
    pub fn new(host: Arc<dyn RemoteHost>) -> Self {
        Self { host }
    }
}

impl HostUi for RemoteUi {
    fn show_message(&self, window: Option<WindowId>, level: MessageLevel, title: &str, message: &str) {
        if let Err(e) = self.host.show_message(window, level, title, message) {
            warn!(error = %e, title, "failed to send message to remote client");
            HeadlessUi.show_message(window, level, title, message);
        }
    }

    fn not_responding(&self, computer: ComputerId) -> NotResponding {
        HeadlessUi.not_responding(computer)
    }

    fn confirm_mount(&self, computer: ComputerId, backing: &str, read_only: bool) -> bool {
        HeadlessUi.confirm_mount(computer, backing, read_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::raw::FEATURE_EXTENDED;

    fn output(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn window_messages_wait_for_ccpc_term() {
        let host = LineHost::new(Vec::new(), &[]);
        host.handshake().unwrap();
        host.open_window(1, 51, 19, "ignored").unwrap();
        host.show_message(None, MessageLevel::Info, "Hi", "there").unwrap();
        assert_eq!(host.decode_input("SP:;-ccpcTerm-\n").unwrap(), None);
        host.open_window(1, 51, 19, "Monitor").unwrap();
        host.set_title(1, "Renamed").unwrap();
        host.close_window(1).unwrap();
        host.close("bye").unwrap();
        assert_eq!(
            output(host.into_inner()),
            "SP:;-ccpcTerm-\nTA:;\"Hi\",\"there\"\nTN:1;Monitor\nTZ:1;Renamed\nTQ:1;\nSC:;bye\n"
        );
    }

    #[test]
    fn line_input_decodes_to_remote_input() {
        let host = LineHost::new(Vec::new(), &[]);
        assert_eq!(
            host.decode_input("TR:2;40,12").unwrap(),
            Some(RemoteInput::Resize { window: 2, width: 40, height: 12 })
        );
        assert_eq!(host.decode_input("TQ:;").unwrap(), Some(RemoteInput::CloseWindow { window: 0 }));
        assert_eq!(host.decode_input("SC:;gone").unwrap(), Some(RemoteInput::CloseConnection));
        let Some(RemoteInput::Event { window: 0, event }) = host.decode_input("EV:;\"char\", \"a\"").unwrap()
        else {
            panic!("expected an event");
        };
        assert_eq!(event.name, "char");
        assert!(host.decode_input("EV:;char").is_err());
    }

    #[test]
    fn raw_render_sends_only_changes() {
        let host = RawHost::new(Vec::new(), false);
        let screen = Screen::new(2, 4, 2);
        assert!(host.render(&screen).unwrap());
        assert!(!host.render(&screen).unwrap());
        screen.update(|f| f.write(b"x"));
        assert!(host.render(&screen).unwrap());

        let text = output(host.into_inner());
        let frames: Vec<Frame> = text.lines().map(|l| FrameCodec::default().decode(l).unwrap()).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.window == 2));
    }

    #[test]
    fn raw_title_change_keeps_window_size() {
        let host = RawHost::new(Vec::new(), false);
        host.open_window(1, 51, 19, "Computer 1").unwrap();
        host.set_title(1, "Renamed").unwrap();
        let text = output(host.into_inner());
        let last = text.lines().last().unwrap();
        let frame = FrameCodec::default().decode(last).unwrap();
        assert_eq!(
            frame.message,
            Message::Window(WindowChange { closing: false, width: 51, height: 19, title: "Renamed".into() })
        );
    }

    #[test]
    fn feature_frames_switch_the_checksum_mode() {
        let host = RawHost::new(Vec::new(), false);
        let client = FrameCodec::default();
        let flags = FEATURE_BINARY_CHECKSUM | FEATURE_EXTENDED;
        let line = client
            .encode(&Frame::new(0, Message::Features { flags, extended: 0 }))
            .unwrap();
        assert_eq!(host.decode_input(&line).unwrap(), None);
        assert!(host.codec().binary_checksum());
    }

    #[test]
    fn raw_keys_become_platform_events() {
        let down = RemoteInput::Key { window: 0, key: 30, ch: Some('a'), up: false, held: true, ctrl: false };
        assert_eq!(
            down.platform_events(),
            vec![
                PlatformEvent::KeyDown { key: 30, repeat: true, ctrl: false },
                PlatformEvent::Text("a".into()),
            ]
        );
        let up = RemoteInput::Key { window: 0, key: 30, ch: None, up: true, held: false, ctrl: false };
        assert_eq!(up.platform_events(), vec![PlatformEvent::KeyUp { key: 30 }]);
        let scroll = RemoteInput::Mouse { window: 3, kind: MouseKind::Scroll, button: 0, x: 2, y: 5 };
        assert_eq!(
            scroll.platform_events(),
            vec![PlatformEvent::MouseWheel { window: 3, direction: -1, x: 2, y: 5 }]
        );
    }

    #[test]
    fn input_for_unowned_windows_is_dropped() {
        let registry = ComputerRegistry::default();
        assert_eq!(dispatch_input(&registry, RemoteInput::CloseWindow { window: 9 }), 0);
    }

    #[tokio::test]
    async fn read_input_records_extensions_and_stops_on_close() {
        let host = Arc::new(LineHost::new(Vec::new(), &[]));
        let registry = Arc::new(ComputerRegistry::default());
        let input: &[u8] = b"SP:;-ccpcTerm-binary-\nnot a message\n\nSC:;bye\nTR:0;1,1\n";
        read_input(input, Arc::clone(&host), registry).await.unwrap();
        assert!(host.has_extension(CCPC_TERM));
        assert!(host.has_extension("binary"));
    }

    #[tokio::test]
    async fn overlong_lines_desync_the_stream() {
        let host = Arc::new(RawHost::new(Vec::new(), false));
        let registry = Arc::new(ComputerRegistry::default());
        let input = vec![b'A'; MAX_LINE + 10];
        let err = read_input(input.as_slice(), host, registry).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Desync));
    }

    #[test]
    fn remote_ui_forwards_messages() {
        let host = Arc::new(RawHost::new(Vec::new(), false));
        let ui = RemoteUi::new(Arc::clone(&host) as Arc<dyn RemoteHost>);
        ui.show_message(Some(1), MessageLevel::Error, "Oops", "bad");
        assert_eq!(ui.not_responding(0), NotResponding::Wait);
        drop(ui);
        let host = Arc::try_unwrap(host).ok().unwrap();
        let text = output(host.into_inner());
        let frame = FrameCodec::default().decode(text.trim_end()).unwrap();
        assert_eq!(
            frame.message,
            Message::Message { flags: MESSAGE_ERROR, title: "Oops".into(), text: "bad".into() }
        );
    }
}
