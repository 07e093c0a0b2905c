//! Terminal screen buffers.
//!
//! A [`Screen`] is the only thing the renderer and the remote serializer see
//! of a computer: a locked [`TerminalFrame`] plus a changed flag. Guest API
//! calls mutate the frame under the lock and set the flag; readers take a
//! snapshot and clear it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Identifier multiplexing windows over one remote connection.
pub type WindowId = u32;

/// Glyph cell size used for pixel-mode dimensions.
pub const FONT_WIDTH: u32 = 6;
pub const FONT_HEIGHT: u32 = 9;

/// Largest terminal a window can be resized to, in character cells. Anything
/// bigger is clamped here and rejected by the input decoders.
pub const MAX_WIDTH: u32 = 512;
pub const MAX_HEIGHT: u32 = 512;

/// Whether a requested window size is one the host will honour.
pub fn size_in_range(width: u32, height: u32) -> bool {
    (1..=MAX_WIDTH).contains(&width) && (1..=MAX_HEIGHT).contains(&height)
}

fn area(width: u32, height: u32) -> usize {
    (width as usize).saturating_mul(height as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn hex(v: u32) -> Self {
        Self { r: (v >> 16) as u8, g: (v >> 8) as u8, b: v as u8 }
    }
}

/// The sixteen standard colors, white (0) through black (15).
pub const DEFAULT_PALETTE: [Rgb; 16] = [
    Rgb::hex(0xF0F0F0),
    Rgb::hex(0xF2B233),
    Rgb::hex(0xE57FD8),
    Rgb::hex(0x99B2F2),
    Rgb::hex(0xDEDE6C),
    Rgb::hex(0x7FCC19),
    Rgb::hex(0xF2B2CC),
    Rgb::hex(0x4C4C4C),
    Rgb::hex(0x999999),
    Rgb::hex(0x4C99B2),
    Rgb::hex(0xB266E5),
    Rgb::hex(0x3366CC),
    Rgb::hex(0x7F664C),
    Rgb::hex(0x57A64E),
    Rgb::hex(0xCC4C4C),
    Rgb::hex(0x111111),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharCell {
    pub glyph: u8,
    pub fg: u8,
    pub bg: u8,
}

impl Default for CharCell {
    fn default() -> Self {
        Self { glyph: b' ', fg: 0x0, bg: 0xF }
    }
}

impl CharCell {
    /// Packed wire form: background in the high nibble.
    pub fn color_byte(&self) -> u8 {
        (self.bg << 4) | (self.fg & 0x0F)
    }

    pub fn from_parts(glyph: u8, color: u8) -> Self {
        Self { glyph, fg: color & 0x0F, bg: color >> 4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GraphicsMode {
    #[default]
    Text = 0,
    LowRes = 1,
    HighRes = 2,
}

impl GraphicsMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Text),
            1 => Some(Self::LowRes),
            2 => Some(Self::HighRes),
            _ => None,
        }
    }

    /// Palette entries that are meaningful in this mode.
    pub fn palette_len(self) -> usize {
        match self {
            Self::HighRes => 256,
            _ => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub x: i32,
    pub y: i32,
    pub blink: bool,
    pub visible: bool,
}

impl Default for Cursor {
    fn default() -> Self {
        Self { x: 0, y: 0, blink: true, visible: true }
    }
}

/// Full contents of one terminal window.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalFrame {
    pub width: u32,
    pub height: u32,
    pub cells: Vec<CharCell>,
    pub cursor: Cursor,
    pub palette: Vec<Rgb>,
    pub mode: GraphicsMode,
    pub pixels: Option<Vec<u8>>,
    /// Colors applied by the next write.
    pub text_fg: u8,
    pub text_bg: u8,
}

impl TerminalFrame {
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height) = (width.min(MAX_WIDTH), height.min(MAX_HEIGHT));
        let mut palette = vec![Rgb::default(); 256];
        palette[..16].copy_from_slice(&DEFAULT_PALETTE);
        Self {
            width,
            height,
            cells: vec![CharCell::default(); area(width, height)],
            cursor: Cursor::default(),
            palette,
            mode: GraphicsMode::Text,
            pixels: None,
            text_fg: 0x0,
            text_bg: 0xF,
        }
    }

    pub fn pixel_width(&self) -> u32 {
        self.width.saturating_mul(FONT_WIDTH)
    }

    pub fn pixel_height(&self) -> u32 {
        self.height.saturating_mul(FONT_HEIGHT)
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }

    pub fn cell(&self, x: i32, y: i32) -> Option<CharCell> {
        self.index(x, y).map(|i| self.cells[i])
    }

    /// Write text at the cursor without wrapping; the cursor advances.
    pub fn write(&mut self, text: &[u8]) {
        let (fg, bg) = (self.text_fg, self.text_bg);
        for &glyph in text {
            if let Some(i) = self.index(self.cursor.x, self.cursor.y) {
                self.cells[i] = CharCell { glyph, fg, bg };
            }
            self.cursor.x = self.cursor.x.saturating_add(1);
        }
    }

    pub fn clear(&mut self) {
        let blank = self.blank();
        self.cells.fill(blank);
        if let Some(pixels) = self.pixels.as_mut() {
            pixels.fill(0x0F);
        }
    }

    pub fn clear_line(&mut self) {
        if self.cursor.y < 0 || self.cursor.y as u32 >= self.height {
            return;
        }
        let blank = self.blank();
        let start = self.cursor.y as usize * self.width as usize;
        self.cells[start..start + self.width as usize].fill(blank);
    }

    /// Scroll the text grid up by `lines` (down when negative).
    pub fn scroll(&mut self, lines: i32) {
        let w = self.width as usize;
        let h = self.height as usize;
        let blank = self.blank();
        if lines.unsigned_abs() as usize >= h {
            self.cells.fill(blank);
            return;
        }
        let n = lines.unsigned_abs() as usize * w;
        if lines > 0 {
            self.cells.copy_within(n.., 0);
            let len = self.cells.len();
            self.cells[len - n..].fill(blank);
        } else if lines < 0 {
            let len = self.cells.len();
            self.cells.copy_within(..len - n, n);
            self.cells[..n].fill(blank);
        }
    }

    fn blank(&self) -> CharCell {
        CharCell { glyph: b' ', fg: self.text_fg, bg: self.text_bg }
    }

    /// Switch modes; entering a pixel mode allocates the pixel buffer.
    pub fn set_mode(&mut self, mode: GraphicsMode) {
        self.mode = mode;
        if mode != GraphicsMode::Text && self.pixels.is_none() {
            self.pixels = Some(vec![0x0F; area(self.pixel_width(), self.pixel_height())]);
        }
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: u8) -> bool {
        let (w, h) = (self.pixel_width(), self.pixel_height());
        if x >= w || y >= h {
            return false;
        }
        let pixels = self
            .pixels
            .get_or_insert_with(|| vec![0x0F; area(w, h)]);
        pixels[area(y, w) + x as usize] = color;
        true
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.pixel_width() || y >= self.pixel_height() {
            return None;
        }
        self.pixels
            .as_ref()
            .and_then(|p| p.get(area(y, self.pixel_width()) + x as usize).copied())
    }

    /// Resize, keeping the overlapping top-left region. Sizes beyond
    /// [`MAX_WIDTH`] x [`MAX_HEIGHT`] are clamped.
    pub fn resize(&mut self, width: u32, height: u32) {
        let (width, height) = (width.min(MAX_WIDTH), height.min(MAX_HEIGHT));
        if width == self.width && height == self.height {
            return;
        }
        let mut cells = vec![self.blank(); area(width, height)];
        for y in 0..height.min(self.height) {
            for x in 0..width.min(self.width) {
                cells[area(y, width) + x as usize] = self.cells[area(y, self.width) + x as usize];
            }
        }
        self.cells = cells;
        let old_pw = self.pixel_width();
        self.width = width;
        self.height = height;
        if let Some(old) = self.pixels.take() {
            let (pw, ph) = (self.pixel_width(), self.pixel_height());
            let mut pixels = vec![0x0F; area(pw, ph)];
            let old_ph = old.len() / (old_pw.max(1) as usize);
            for y in 0..(ph as usize).min(old_ph) {
                for x in 0..(pw.min(old_pw) as usize) {
                    pixels[y * pw as usize + x] = old[y * old_pw as usize + x];
                }
            }
            self.pixels = Some(pixels);
        }
    }
}

/// A window's frame behind its lock, plus the renderer's dirty flag.
#[derive(Debug)]
pub struct Screen {
    window: WindowId,
    frame: Mutex<TerminalFrame>,
    changed: AtomicBool,
}

impl Screen {
    pub fn new(window: WindowId, width: u32, height: u32) -> Self {
        Self {
            window,
            frame: Mutex::new(TerminalFrame::new(width, height)),
            changed: AtomicBool::new(true),
        }
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    /// Read access; does not touch the changed flag.
    pub fn lock(&self) -> MutexGuard<'_, TerminalFrame> {
        self.frame.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate the frame and mark it changed.
    pub fn update<R>(&self, f: impl FnOnce(&mut TerminalFrame) -> R) -> R {
        let result = f(&mut self.lock());
        self.changed.store(true, Ordering::Release);
        result
    }

    /// Copy out the frame if it changed since the last call.
    pub fn take_changed(&self) -> Option<TerminalFrame> {
        if self.changed.swap(false, Ordering::AcqRel) {
            Some(self.lock().clone())
        } else {
            None
        }
    }

    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> TerminalFrame {
        self.lock().clone()
    }

    /// Blank the frame for a fresh boot, keeping its size.
    pub fn reset(&self) {
        self.update(|frame| {
            *frame = TerminalFrame::new(frame.width, frame.height);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_clips_at_the_right_edge() {
        let mut frame = TerminalFrame::new(4, 2);
        frame.cursor.x = 2;
        frame.write(b"abc");
        assert_eq!(frame.cell(2, 0).unwrap().glyph, b'a');
        assert_eq!(frame.cell(3, 0).unwrap().glyph, b'b');
        assert_eq!(frame.cursor.x, 5);
    }

    #[test]
    fn scroll_moves_rows_up() {
        let mut frame = TerminalFrame::new(2, 3);
        frame.cursor.y = 2;
        frame.write(b"zz");
        frame.scroll(1);
        assert_eq!(frame.cell(0, 1).unwrap().glyph, b'z');
        assert_eq!(frame.cell(0, 2).unwrap().glyph, b' ');
        frame.scroll(-1);
        assert_eq!(frame.cell(0, 2).unwrap().glyph, b'z');
    }

    #[test]
    fn resize_keeps_overlap() {
        let mut frame = TerminalFrame::new(3, 3);
        frame.write(b"abc");
        frame.resize(2, 4);
        assert_eq!(frame.cells.len(), 8);
        assert_eq!(frame.cell(1, 0).unwrap().glyph, b'b');
        assert_eq!(frame.cell(0, 3).unwrap().glyph, b' ');
    }

    #[test]
    fn oversized_frames_are_clamped() {
        let mut frame = TerminalFrame::new(100_000, 3);
        assert_eq!((frame.width, frame.height), (MAX_WIDTH, 3));
        frame.resize(100_000, 100_000);
        assert_eq!((frame.width, frame.height), (MAX_WIDTH, MAX_HEIGHT));
        assert_eq!(frame.cells.len(), (MAX_WIDTH * MAX_HEIGHT) as usize);
        frame.set_mode(GraphicsMode::LowRes);
        assert_eq!(
            frame.pixels.as_ref().map(Vec::len),
            Some((MAX_WIDTH * FONT_WIDTH * MAX_HEIGHT * FONT_HEIGHT) as usize)
        );
        assert!(!size_in_range(MAX_WIDTH + 1, 1));
        assert!(!size_in_range(0, 1));
        assert!(size_in_range(MAX_WIDTH, MAX_HEIGHT));
    }

    #[test]
    fn cursor_stops_advancing_at_the_limit() {
        let mut frame = TerminalFrame::new(4, 1);
        frame.cursor.x = i32::MAX - 1;
        frame.write(b"abc");
        assert_eq!(frame.cursor.x, i32::MAX);
        assert_eq!(frame.cell(0, 0).unwrap().glyph, b' ');
    }

    #[test]
    fn color_byte_packs_background_high() {
        let cell = CharCell { glyph: b'x', fg: 0x1, bg: 0xE };
        assert_eq!(cell.color_byte(), 0xE1);
        assert_eq!(CharCell::from_parts(b'x', 0xE1), cell);
    }

    #[test]
    fn screen_changed_flag_is_consumed() {
        let screen = Screen::new(0, 5, 2);
        assert!(screen.take_changed().is_some());
        assert!(screen.take_changed().is_none());
        screen.update(|f| f.write(b"hi"));
        assert!(screen.is_changed());
        assert_eq!(screen.take_changed().unwrap().cell(1, 0).unwrap().glyph, b'i');
    }
}
