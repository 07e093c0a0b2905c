//! Line protocol: `CODE:window;payload\n`.
//!
//! | Code | Direction | Payload |
//! |------|-----------|---------|
//! | `SP` | both      | `-feature-feature-` handshake |
//! | `TN` | host      | title of a newly opened window |
//! | `TQ` | both      | window closed |
//! | `TZ` | host      | new window title |
//! | `TA` | host      | `"title","message"` |
//! | `TR` | client    | `width,height` |
//! | `SC` | both      | connection closing, free-form message |
//! | `EV` | client    | literal argument list, event name first |
//!
//! An empty window field means window 0.

use std::collections::BTreeSet;
use std::fmt;

use super::ProtocolError;
use crate::event::Event;
use crate::screen::{MAX_HEIGHT, MAX_WIDTH, WindowId, size_in_range};
use crate::value::Value;

/// Extension that enables window lifecycle messages.
pub const CCPC_TERM: &str = "ccpcTerm";

const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCode {
    Features,
    Open,
    Close,
    Title,
    Alert,
    Resize,
    Shutdown,
    Event,
}

impl LineCode {
    pub fn as_str(self) -> &'static str {
        match self {
            LineCode::Features => "SP",
            LineCode::Open => "TN",
            LineCode::Close => "TQ",
            LineCode::Title => "TZ",
            LineCode::Alert => "TA",
            LineCode::Resize => "TR",
            LineCode::Shutdown => "SC",
            LineCode::Event => "EV",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "SP" => LineCode::Features,
            "TN" => LineCode::Open,
            "TQ" => LineCode::Close,
            "TZ" => LineCode::Title,
            "TA" => LineCode::Alert,
            "TR" => LineCode::Resize,
            "SC" => LineCode::Shutdown,
            "EV" => LineCode::Event,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMessage {
    pub code: LineCode,
    pub window: Option<WindowId>,
    pub payload: String,
}

impl LineMessage {
    pub fn new(code: LineCode, window: Option<WindowId>, payload: impl Into<String>) -> Self {
        Self { code, window, payload: payload.into() }
    }

    pub fn target(&self) -> WindowId {
        self.window.unwrap_or(0)
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let malformed = || ProtocolError::Malformed(format!("line message {line:?}"));
        let (code, rest) = line.split_at_checked(2).ok_or_else(malformed)?;
        let rest = rest.strip_prefix(':').ok_or_else(malformed)?;
        let (meta, payload) = rest.split_once(';').ok_or_else(malformed)?;
        let code = LineCode::parse(code)
            .ok_or_else(|| ProtocolError::Malformed(format!("unknown line code {code:?}")))?;
        let window = match meta.trim() {
            "" => None,
            id => Some(
                id.parse::<WindowId>()
                    .map_err(|_| ProtocolError::Malformed(format!("window id {id:?}")))?,
            ),
        };
        Ok(Self::new(code, window, payload))
    }

    /// One wire line, newline included. Line breaks inside the payload are
    /// flattened to spaces.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for LineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code.as_str())?;
        f.write_str(":")?;
        if let Some(window) = self.window {
            write!(f, "{window}")?;
        }
        f.write_str(";")?;
        f.write_str(&self.payload.replace(['\r', '\n'], " "))
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

pub fn feature_payload<'a>(features: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::from("-");
    for feature in features {
        out.push_str(feature);
        out.push('-');
    }
    out
}

pub fn parse_features(payload: &str) -> BTreeSet<String> {
    payload
        .split('-')
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn alert_payload(title: &str, message: &str) -> String {
    format!("\"{title}\",\"{message}\"")
}

/// Split a `"title","message"` payload at the first `","`.
pub fn parse_alert(payload: &str) -> Option<(String, String)> {
    let inner = payload.strip_prefix('"')?.strip_suffix('"')?;
    let (title, message) = inner.split_once("\",\"")?;
    Some((title.to_string(), message.to_string()))
}

pub fn parse_resize(payload: &str) -> Result<(u32, u32), ProtocolError> {
    let malformed = || ProtocolError::Malformed(format!("resize payload {payload:?}"));
    let (w, h) = payload.split_once(',').ok_or_else(malformed)?;
    let w = w.trim().parse().map_err(|_| malformed())?;
    let h = h.trim().parse().map_err(|_| malformed())?;
    if !size_in_range(w, h) {
        return Err(ProtocolError::Malformed(format!(
            "resize to {w}x{h} (limit {MAX_WIDTH}x{MAX_HEIGHT})"
        )));
    }
    Ok((w, h))
}

/// Parse an `EV` payload such as `"key", 28, false`.
pub fn parse_event(payload: &str) -> Result<Event, ProtocolError> {
    let mut values = Literals::new(payload).list()?.into_iter();
    match values.next() {
        Some(Value::String(name)) => Ok(Event::new(name, values.collect())),
        _ => Err(ProtocolError::Malformed(format!("event without a name: {payload:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Literal parser
// ---------------------------------------------------------------------------

/// Guest-syntax literals: strings, numbers, booleans, nil and tables.
struct Literals<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Literals<'a> {
    fn new(src: &'a str) -> Self {
        Self { src: src.as_bytes(), pos: 0 }
    }

    fn error(&self, what: &str) -> ProtocolError {
        ProtocolError::Malformed(format!("{what} at offset {}", self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        self.skip_ws();
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn list(&mut self) -> Result<Vec<Value>, ProtocolError> {
        let mut out = Vec::new();
        self.skip_ws();
        if self.peek().is_none() {
            return Ok(out);
        }
        loop {
            out.push(self.value(0)?);
            self.skip_ws();
            match self.peek() {
                None => return Ok(out),
                Some(b',') => self.pos += 1,
                Some(_) => return Err(self.error("expected ','")),
            }
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, ProtocolError> {
        self.skip_ws();
        match self.peek() {
            Some(q @ (b'"' | b'\'')) => self.string(q),
            Some(b'{') => self.table(depth),
            Some(b) if b == b'-' || b == b'.' || b.is_ascii_digit() => self.number(),
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => {
                let word = self.ident();
                keyword(word).ok_or_else(|| self.error("unexpected identifier"))
            }
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn ident(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default()
    }

    fn string(&mut self, quote: u8) -> Result<Value, ProtocolError> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            let b = self.peek().ok_or_else(|| self.error("unterminated string"))?;
            self.pos += 1;
            if b == quote {
                break;
            }
            if b != b'\\' {
                out.push(b);
                continue;
            }
            let esc = self.peek().ok_or_else(|| self.error("unterminated escape"))?;
            self.pos += 1;
            match esc {
                b'n' => out.push(b'\n'),
                b't' => out.push(b'\t'),
                b'r' => out.push(b'\r'),
                b'a' => out.push(0x07),
                b'b' => out.push(0x08),
                b'f' => out.push(0x0C),
                b'v' => out.push(0x0B),
                b'0'..=b'9' => {
                    let mut code = u32::from(esc - b'0');
                    for _ in 0..2 {
                        match self.peek() {
                            Some(d) if d.is_ascii_digit() => {
                                code = code * 10 + u32::from(d - b'0');
                                self.pos += 1;
                            }
                            _ => break,
                        }
                    }
                    out.push(u8::try_from(code).map_err(|_| self.error("escape out of range"))?);
                }
                other => out.push(other),
            }
        }
        Ok(Value::String(String::from_utf8_lossy(&out).into_owned()))
    }

    fn number(&mut self) -> Result<Value, ProtocolError> {
        let start = self.pos;
        let negative = self.peek() == Some(b'-');
        if negative {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while self.peek().is_some_and(|b| {
            b.is_ascii_alphanumeric()
                || b == b'.'
                || ((b == b'-' || b == b'+')
                    && matches!(self.src[self.pos - 1], b'e' | b'E')
                    && !self.src[digits_start..self.pos].starts_with(b"0x"))
        }) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[digits_start..self.pos]).unwrap_or_default();
        let sign = if negative { -1 } else { 1 };
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16).ok().map(|v| Value::Integer(sign * v))
        } else if let Ok(v) = text.parse::<i64>() {
            Some(Value::Integer(sign * v))
        } else {
            text.parse::<f64>().ok().map(|v| Value::Number(sign as f64 * v))
        };
        parsed.ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "bad number {:?}",
                String::from_utf8_lossy(&self.src[start..self.pos])
            ))
        })
    }

    fn table(&mut self, depth: usize) -> Result<Value, ProtocolError> {
        if depth >= MAX_DEPTH {
            return Err(self.error("tables nested too deeply"));
        }
        self.pos += 1;
        let mut entries = Vec::new();
        let mut next_index = 1i64;
        loop {
            if self.eat(b'}') {
                return Ok(Value::Table(entries));
            }
            self.skip_ws();
            let entry = match self.peek() {
                Some(b'[') => {
                    self.pos += 1;
                    let key = self.value(depth + 1)?;
                    if !self.eat(b']') || !self.eat(b'=') {
                        return Err(self.error("expected ']' '='"));
                    }
                    (key, self.value(depth + 1)?)
                }
                Some(b) if b.is_ascii_alphabetic() || b == b'_' => {
                    let save = self.pos;
                    let word = self.ident();
                    self.skip_ws();
                    if self.peek() == Some(b'=') && self.src.get(self.pos + 1) != Some(&b'=') {
                        self.pos += 1;
                        (Value::str(word), self.value(depth + 1)?)
                    } else {
                        self.pos = save;
                        let value = self.value(depth + 1)?;
                        next_index += 1;
                        (Value::Integer(next_index - 1), value)
                    }
                }
                _ => {
                    let value = self.value(depth + 1)?;
                    next_index += 1;
                    (Value::Integer(next_index - 1), value)
                }
            };
            entries.push(entry);
            if !self.eat(b',') && !self.eat(b';') {
                if self.eat(b'}') {
                    return Ok(Value::Table(entries));
                }
                return Err(self.error("expected ',' or '}'"));
            }
        }
    }
}

fn keyword(word: &str) -> Option<Value> {
    match word {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "nil" => Some(Value::Nil),
        _ => None,
    }
}
