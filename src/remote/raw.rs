//! Binary frame protocol.
//!
//! ```text
//!  !CPC 0008 AQAcAAE= 98b704b3 \n       4 hex digits of base64 length
//!  !CPD 000000012a40 …      …  \n       12 hex digits once it reaches 64 KiB
//!
//!  payload = [type u8][window u8][body …]
//! ```
//!
//! The CRC32 trailer covers the base64 text, or the decoded payload once
//! [`FEATURE_BINARY_CHECKSUM`] has been negotiated. Multi-byte integers are
//! little-endian and strings are NUL-terminated.

use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::ProtocolError;
use crate::event::Event;
use crate::screen::{CharCell, FONT_HEIGHT, FONT_WIDTH, GraphicsMode, MAX_HEIGHT, MAX_WIDTH, Rgb, TerminalFrame};
use crate::value::Value;

pub const TYPE_TERMINAL: u8 = 0;
pub const TYPE_KEY: u8 = 1;
pub const TYPE_MOUSE: u8 = 2;
pub const TYPE_EVENT: u8 = 3;
pub const TYPE_WINDOW: u8 = 4;
pub const TYPE_MESSAGE: u8 = 5;
pub const TYPE_FEATURES: u8 = 6;

pub const FEATURE_BINARY_CHECKSUM: u16 = 0x0001;
pub const FEATURE_FILESYSTEM: u16 = 0x0002;
pub const FEATURE_SEND_ALL_WINDOWS: u16 = 0x0004;
pub const FEATURE_EXTENDED: u16 = 0x8000;

/// Message box flags carried by [`Message::Message`].
pub const MESSAGE_ERROR: u32 = 0x10;
pub const MESSAGE_WARNING: u32 = 0x20;
pub const MESSAGE_INFORMATION: u32 = 0x40;

const KEY_UP: u8 = 0x01;
const KEY_HELD: u8 = 0x02;
const KEY_CTRL: u8 = 0x04;

const MAX_TABLE_DEPTH: usize = 32;

const PARAM_INT: u8 = 0;
const PARAM_DOUBLE: u8 = 1;
const PARAM_BOOL: u8 = 2;
const PARAM_STRING: u8 = 3;
const PARAM_TABLE: u8 = 4;
const PARAM_NIL: u8 = 5;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ScreenData {
    Text { glyphs: Vec<u8>, colors: Vec<u8> },
    Pixels(Vec<u8>),
}

/// Full contents of one window, as sent after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub mode: GraphicsMode,
    pub cursor_blink: bool,
    pub width: u16,
    pub height: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub data: ScreenData,
    pub palette: Vec<Rgb>,
}

impl Snapshot {
    pub fn capture(frame: &TerminalFrame) -> Result<Self, ProtocolError> {
        let width = u16::try_from(frame.width)
            .map_err(|_| ProtocolError::Unencodable(format!("width {}", frame.width)))?;
        let height = u16::try_from(frame.height)
            .map_err(|_| ProtocolError::Unencodable(format!("height {}", frame.height)))?;
        let data = match frame.mode {
            GraphicsMode::Text => ScreenData::Text {
                glyphs: frame.cells.iter().map(|c| c.glyph).collect(),
                colors: frame.cells.iter().map(CharCell::color_byte).collect(),
            },
            _ => ScreenData::Pixels(frame.pixels.clone().unwrap_or_else(|| {
                vec![0x0F; frame.pixel_width() as usize * frame.pixel_height() as usize]
            })),
        };
        let cursor = |v: i32| v.clamp(0, u16::MAX as i32) as u16;
        Ok(Self {
            mode: frame.mode,
            cursor_blink: frame.cursor.blink && frame.cursor.visible,
            width,
            height,
            cursor_x: cursor(frame.cursor.x),
            cursor_y: cursor(frame.cursor.y),
            data,
            palette: frame.palette.iter().take(frame.mode.palette_len()).copied().collect(),
        })
    }

    /// Overwrite `frame` with this snapshot.
    pub fn apply(&self, frame: &mut TerminalFrame) {
        frame.resize(self.width as u32, self.height as u32);
        frame.set_mode(self.mode);
        frame.cursor.x = self.cursor_x as i32;
        frame.cursor.y = self.cursor_y as i32;
        frame.cursor.blink = self.cursor_blink;
        match &self.data {
            ScreenData::Text { glyphs, colors } => {
                for (cell, (glyph, color)) in frame.cells.iter_mut().zip(glyphs.iter().zip(colors)) {
                    *cell = CharCell::from_parts(*glyph, *color);
                }
            }
            ScreenData::Pixels(pixels) => frame.pixels = Some(pixels.clone()),
        }
        for (slot, rgb) in frame.palette.iter_mut().zip(&self.palette) {
            *slot = *rgb;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MouseKind {
    Click = 0,
    Up = 1,
    Scroll = 2,
    Drag = 3,
}

impl MouseKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Click),
            1 => Some(Self::Up),
            2 => Some(Self::Scroll),
            3 => Some(Self::Drag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowChange {
    pub closing: bool,
    pub width: u16,
    pub height: u16,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Terminal(Snapshot),
    /// `ch` is 0 when the key produces no character.
    Key { key: u8, ch: u8, up: bool, held: bool, ctrl: bool },
    /// `button` is the scroll direction for [`MouseKind::Scroll`]: 0 up, 1 down.
    Mouse { kind: MouseKind, button: u8, x: u32, y: u32 },
    Event(Event),
    Window(WindowChange),
    Message { flags: u32, title: String, text: String },
    Features { flags: u16, extended: u32 },
}

impl Message {
    pub fn type_id(&self) -> u8 {
        match self {
            Message::Terminal(_) => TYPE_TERMINAL,
            Message::Key { .. } => TYPE_KEY,
            Message::Mouse { .. } => TYPE_MOUSE,
            Message::Event(_) => TYPE_EVENT,
            Message::Window(_) => TYPE_WINDOW,
            Message::Message { .. } => TYPE_MESSAGE,
            Message::Features { .. } => TYPE_FEATURES,
        }
    }

    fn write_body(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Message::Terminal(snap) => {
                out.push(snap.mode as u8);
                out.push(u8::from(snap.cursor_blink));
                for v in [snap.width, snap.height, snap.cursor_x, snap.cursor_y] {
                    out.extend(v.to_le_bytes());
                }
                out.extend([0; 4]);
                match &snap.data {
                    ScreenData::Text { glyphs, colors } => {
                        rle_encode(out, glyphs);
                        rle_encode(out, colors);
                    }
                    ScreenData::Pixels(pixels) => rle_encode(out, pixels),
                }
                for rgb in &snap.palette {
                    out.extend([rgb.r, rgb.g, rgb.b]);
                }
            }
            Message::Key { key, ch, up, held, ctrl } => {
                let mut flags = 0;
                if *up {
                    flags |= KEY_UP;
                }
                if *held {
                    flags |= KEY_HELD;
                }
                if *ctrl {
                    flags |= KEY_CTRL;
                }
                out.extend([*key, *ch, flags]);
            }
            Message::Mouse { kind, button, x, y } => {
                out.extend([*kind as u8, *button]);
                out.extend(x.to_le_bytes());
                out.extend(y.to_le_bytes());
            }
            Message::Event(event) => {
                let count = u8::try_from(event.args.len())
                    .map_err(|_| ProtocolError::Unencodable("more than 255 event parameters".into()))?;
                out.push(count);
                write_cstr(out, &event.name)?;
                for arg in &event.args {
                    write_value(out, arg)?;
                }
            }
            Message::Window(change) => {
                out.extend([u8::from(change.closing), 0]);
                out.extend(change.width.to_le_bytes());
                out.extend(change.height.to_le_bytes());
                write_cstr(out, &change.title)?;
            }
            Message::Message { flags, title, text } => {
                out.extend(flags.to_le_bytes());
                write_cstr(out, title)?;
                write_cstr(out, text)?;
            }
            Message::Features { flags, extended } => {
                out.extend(flags.to_le_bytes());
                if flags & FEATURE_EXTENDED != 0 {
                    out.extend(extended.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    fn read_body(ty: u8, r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(match ty {
            TYPE_TERMINAL => {
                let mode_byte = r.u8()?;
                let mode = GraphicsMode::from_u8(mode_byte)
                    .ok_or_else(|| ProtocolError::Malformed(format!("graphics mode {mode_byte}")))?;
                let cursor_blink = r.u8()? != 0;
                let (width, height) = check_size(r.u16()?, r.u16()?)?;
                let (cursor_x, cursor_y) = (r.u16()?, r.u16()?);
                r.take(4)?;
                let cells = width as usize * height as usize;
                let data = match mode {
                    GraphicsMode::Text => ScreenData::Text {
                        glyphs: rle_decode(r, cells)?,
                        colors: rle_decode(r, cells)?,
                    },
                    _ => ScreenData::Pixels(rle_decode(
                        r,
                        cells * (FONT_WIDTH * FONT_HEIGHT) as usize,
                    )?),
                };
                let palette = (0..mode.palette_len())
                    .map(|_| Ok(Rgb { r: r.u8()?, g: r.u8()?, b: r.u8()? }))
                    .collect::<Result<Vec<_>, ProtocolError>>()?;
                Message::Terminal(Snapshot {
                    mode,
                    cursor_blink,
                    width,
                    height,
                    cursor_x,
                    cursor_y,
                    data,
                    palette,
                })
            }
            TYPE_KEY => {
                let (key, ch, flags) = (r.u8()?, r.u8()?, r.u8()?);
                Message::Key {
                    key,
                    ch,
                    up: flags & KEY_UP != 0,
                    held: flags & KEY_HELD != 0,
                    ctrl: flags & KEY_CTRL != 0,
                }
            }
            TYPE_MOUSE => {
                let kind_byte = r.u8()?;
                let kind = MouseKind::from_u8(kind_byte)
                    .ok_or_else(|| ProtocolError::Malformed(format!("mouse event type {kind_byte}")))?;
                Message::Mouse { kind, button: r.u8()?, x: r.u32()?, y: r.u32()? }
            }
            TYPE_EVENT => {
                let count = r.u8()?;
                let name = r.cstr()?;
                let args = (0..count)
                    .map(|_| read_value(r, 0))
                    .collect::<Result<Vec<_>, _>>()?;
                Message::Event(Event::new(name, args))
            }
            TYPE_WINDOW => {
                let closing = r.u8()? != 0;
                if closing && r.remaining() == 0 {
                    return Ok(Message::Window(WindowChange {
                        closing,
                        width: 0,
                        height: 0,
                        title: String::new(),
                    }));
                }
                r.u8()?;
                let (width, height) = check_size(r.u16()?, r.u16()?)?;
                Message::Window(WindowChange { closing, width, height, title: r.cstr()? })
            }
            TYPE_MESSAGE => Message::Message { flags: r.u32()?, title: r.cstr()?, text: r.cstr()? },
            TYPE_FEATURES => {
                let flags = r.u16()?;
                let extended = if flags & FEATURE_EXTENDED != 0 { r.u32()? } else { 0 };
                Message::Features { flags, extended }
            }
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// One decoded message and the window it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub window: u8,
    pub message: Message,
}

impl Frame {
    pub fn new(window: u8, message: Message) -> Self {
        Self { window, message }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![self.message.type_id(), self.window];
        self.message.write_body(&mut out)?;
        Ok(out)
    }

    /// Parse a decoded payload. Trailing bytes are ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let ty = r.u8()?;
        let window = r.u8()?;
        Ok(Self::new(window, Message::read_body(ty, &mut r)?))
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Frame encoder/decoder for one connection.
///
/// The checksum mode is shared by both directions and may flip at any time
/// when a [`Message::Features`] frame arrives.
#[derive(Debug, Default)]
pub struct FrameCodec {
    binary_checksum: AtomicBool,
}

impl FrameCodec {
    pub fn new(binary_checksum: bool) -> Self {
        Self { binary_checksum: AtomicBool::new(binary_checksum) }
    }

    pub fn binary_checksum(&self) -> bool {
        self.binary_checksum.load(Ordering::Acquire)
    }

    pub fn set_binary_checksum(&self, on: bool) {
        self.binary_checksum.store(on, Ordering::Release);
    }

    /// Encode `frame` as one line, trailing newline included.
    pub fn encode(&self, frame: &Frame) -> Result<String, ProtocolError> {
        let payload = frame.to_payload()?;
        let text = STANDARD.encode(&payload);
        let sum = if self.binary_checksum() {
            crc32fast::hash(&payload)
        } else {
            crc32fast::hash(text.as_bytes())
        };
        let header = if text.len() < 0x1_0000 {
            format!("!CPC{:04x}", text.len())
        } else {
            format!("!CPD{:012x}", text.len())
        };
        Ok(format!("{header}{text}{sum:08x}\n"))
    }

    /// Decode one line. Bytes before the `!CP` marker are skipped.
    pub fn decode(&self, line: &str) -> Result<Frame, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let start = line
            .find("!CP")
            .ok_or_else(|| ProtocolError::Header("missing !CP marker".into()))?;
        let rest = &line[start + 3..];
        let digits = match rest.as_bytes().first() {
            Some(b'C') => 4,
            Some(b'D') => 12,
            Some(other) => {
                return Err(ProtocolError::Header(format!("unknown frame kind {:?}", *other as char)));
            }
            None => return Err(ProtocolError::Truncated),
        };
        let rest = &rest[1..];
        let len_hex = rest.get(..digits).ok_or(ProtocolError::Truncated)?;
        let len = usize::from_str_radix(len_hex, 16)
            .map_err(|_| ProtocolError::Header(format!("bad length field {len_hex:?}")))?;
        let body = &rest[digits..];
        let text = body.get(..len).ok_or(ProtocolError::Truncated)?;
        let sum_hex = body
            .get(len..)
            .and_then(|s| s.get(..8))
            .ok_or(ProtocolError::Truncated)?;
        let expected = u32::from_str_radix(sum_hex, 16)
            .map_err(|_| ProtocolError::Header(format!("bad checksum field {sum_hex:?}")))?;

        let verify = |actual: u32| {
            if actual == expected {
                Ok(())
            } else {
                Err(ProtocolError::Checksum { expected, actual })
            }
        };
        let payload = if self.binary_checksum() {
            let payload = STANDARD.decode(text)?;
            verify(crc32fast::hash(&payload))?;
            payload
        } else {
            verify(crc32fast::hash(text.as_bytes()))?;
            STANDARD.decode(text)?
        };
        Frame::parse(&payload)
    }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Run-length encode as `(value, count)` pairs, runs capped at 255.
fn rle_encode(out: &mut Vec<u8>, data: &[u8]) {
    let mut iter = data.iter().copied();
    let Some(mut current) = iter.next() else {
        return;
    };
    let mut run: u8 = 1;
    for b in iter {
        if b != current || run == u8::MAX {
            out.extend([current, run]);
            current = b;
            run = 0;
        }
        run += 1;
    }
    out.extend([current, run]);
}

/// Zero is allowed (a window change that keeps its size); anything above the
/// host's terminal limit is not.
fn check_size(width: u16, height: u16) -> Result<(u16, u16), ProtocolError> {
    if u32::from(width) > MAX_WIDTH || u32::from(height) > MAX_HEIGHT {
        return Err(ProtocolError::Malformed(format!(
            "window size {width}x{height} exceeds {MAX_WIDTH}x{MAX_HEIGHT}"
        )));
    }
    Ok((width, height))
}

fn rle_decode(r: &mut Reader<'_>, len: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    while out.len() < len {
        let value = r.u8()?;
        let run = r.u8()? as usize;
        if out.len() + run > len {
            return Err(ProtocolError::Malformed("run-length data overflows the screen".into()));
        }
        out.resize(out.len() + run, value);
    }
    Ok(out)
}

fn write_cstr(out: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    if s.as_bytes().contains(&0) {
        return Err(ProtocolError::Unencodable(format!("string with NUL: {s:?}")));
    }
    out.extend(s.as_bytes());
    out.push(0);
    Ok(())
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), ProtocolError> {
    match value {
        Value::Nil => out.push(PARAM_NIL),
        Value::Bool(b) => out.extend([PARAM_BOOL, u8::from(*b)]),
        Value::Integer(i) => match i32::try_from(*i) {
            Ok(i) => {
                out.push(PARAM_INT);
                out.extend(i.to_le_bytes());
            }
            Err(_) => {
                out.push(PARAM_DOUBLE);
                out.extend((*i as f64).to_le_bytes());
            }
        },
        Value::Number(n) => {
            out.push(PARAM_DOUBLE);
            out.extend(n.to_le_bytes());
        }
        Value::String(s) => {
            out.push(PARAM_STRING);
            write_cstr(out, s)?;
        }
        Value::Table(entries) => {
            let count = u8::try_from(entries.len())
                .map_err(|_| ProtocolError::Unencodable("table with more than 255 entries".into()))?;
            out.extend([PARAM_TABLE, count]);
            for (k, v) in entries {
                write_value(out, k)?;
                write_value(out, v)?;
            }
        }
    }
    Ok(())
}

fn read_value(r: &mut Reader<'_>, depth: usize) -> Result<Value, ProtocolError> {
    Ok(match r.u8()? {
        PARAM_INT => Value::Integer(r.i32()? as i64),
        PARAM_DOUBLE => Value::Number(r.f64()?),
        PARAM_BOOL => Value::Bool(r.u8()? != 0),
        PARAM_STRING => Value::String(r.cstr()?),
        PARAM_TABLE => {
            if depth >= MAX_TABLE_DEPTH {
                return Err(ProtocolError::Malformed("tables nested too deeply".into()));
            }
            let count = r.u8()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let k = read_value(r, depth + 1)?;
                let v = read_value(r, depth + 1)?;
                entries.push((k, v));
            }
            Value::Table(entries)
        }
        _ => Value::Nil,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ProtocolError::Truncated)?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        self.take(N)?.try_into().map_err(|_| ProtocolError::Truncated)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn cstr(&mut self) -> Result<String, ProtocolError> {
        let rest = &self.buf[self.pos..];
        let nul = rest.iter().position(|b| *b == 0).ok_or(ProtocolError::Truncated)?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }
}
