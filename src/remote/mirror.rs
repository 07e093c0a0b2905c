//! Client-side copies of a host's windows, rebuilt from raw frames.

use std::collections::BTreeMap;

use tracing::debug;

use super::ProtocolError;
use super::raw::{Frame, FrameCodec, Message};
use crate::screen::TerminalFrame;

#[derive(Debug, Clone)]
pub struct MirroredWindow {
    pub title: String,
    pub frame: TerminalFrame,
}

impl MirroredWindow {
    fn new(width: u32, height: u32) -> Self {
        Self { title: String::new(), frame: TerminalFrame::new(width, height) }
    }

    /// Text grid, one line per row.
    pub fn text(&self) -> String {
        self.frame
            .cells
            .chunks(self.frame.width.max(1) as usize)
            .map(|row| row.iter().map(|c| c.glyph as char).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A message box the host asked the client to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub window: u8,
    pub flags: u32,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct WindowMirror {
    codec: FrameCodec,
    windows: BTreeMap<u8, MirroredWindow>,
    notices: Vec<Notice>,
}

impl WindowMirror {
    pub fn new(binary_checksum: bool) -> Self {
        Self { codec: FrameCodec::new(binary_checksum), ..Default::default() }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Decode and apply one line. A rejected line changes nothing.
    pub fn receive(&mut self, line: &str) -> Result<Frame, ProtocolError> {
        let frame = self.codec.decode(line)?;
        self.apply(&frame);
        Ok(frame)
    }

    pub fn apply(&mut self, frame: &Frame) {
        match &frame.message {
            Message::Terminal(snap) => {
                let window = self
                    .windows
                    .entry(frame.window)
                    .or_insert_with(|| MirroredWindow::new(snap.width.into(), snap.height.into()));
                snap.apply(&mut window.frame);
            }
            Message::Window(change) if change.closing => {
                self.windows.remove(&frame.window);
            }
            Message::Window(change) => {
                let window = self
                    .windows
                    .entry(frame.window)
                    .or_insert_with(|| MirroredWindow::new(change.width.into(), change.height.into()));
                window.title.clone_from(&change.title);
                if change.width > 0 && change.height > 0 {
                    window.frame.resize(change.width.into(), change.height.into());
                }
            }
            Message::Message { flags, title, text } => self.notices.push(Notice {
                window: frame.window,
                flags: *flags,
                title: title.clone(),
                text: text.clone(),
            }),
            Message::Features { flags, .. } => {
                self.codec
                    .set_binary_checksum(flags & super::raw::FEATURE_BINARY_CHECKSUM != 0);
            }
            Message::Key { .. } | Message::Mouse { .. } | Message::Event(_) => {
                debug!(window = frame.window, "input frame received by a mirror; ignored");
            }
        }
    }

    pub fn window(&self, id: u8) -> Option<&MirroredWindow> {
        self.windows.get(&id)
    }

    pub fn window_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.windows.keys().copied()
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }
}
