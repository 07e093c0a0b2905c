//! `term` library.
//!
//! Colors cross the API as single-bit flags (`1 << index`); the frame stores
//! palette indices. Cursor coordinates are 1-based on the guest side.

use std::sync::Arc;

use crate::computer::ComputerHandle;
use crate::screen::{GraphicsMode, Rgb, Screen, TerminalFrame};
use crate::value::Value;

use super::{ApiError, Library, arg_bool, arg_int, arg_num, opt};

/// Palette index for a color flag.
pub fn color_index(flag: i64) -> Result<u8, ApiError> {
    if flag <= 0 || flag > 0x8000 || flag & (flag - 1) != 0 {
        return Err(ApiError::Failed(format!("Invalid color (got {flag})")));
    }
    Ok(flag.trailing_zeros() as u8)
}

pub fn color_flag(index: u8) -> i64 {
    1 << (index & 0x0F)
}

fn bind<F>(computer: &ComputerHandle, f: F) -> impl Fn(&[Value]) -> Result<Vec<Value>, ApiError> + Send + Sync + 'static
where
    F: Fn(&Arc<Screen>, &[Value]) -> Result<Vec<Value>, ApiError> + Send + Sync + 'static,
{
    let computer = computer.clone();
    move |args| {
        let screen = computer.screen().ok_or(ApiError::Gone)?;
        f(&screen, args)
    }
}

fn pixel_color(frame: &TerminalFrame, color: i64) -> Result<u8, ApiError> {
    match frame.mode {
        GraphicsMode::HighRes => u8::try_from(color)
            .map_err(|_| ApiError::Failed(format!("Invalid color (got {color})"))),
        _ => color_index(color),
    }
}

fn palette_slot(frame: &TerminalFrame, color: i64) -> Result<usize, ApiError> {
    match frame.mode {
        GraphicsMode::HighRes => usize::try_from(color)
            .ok()
            .filter(|c| *c < 256)
            .ok_or_else(|| ApiError::Failed(format!("Invalid color (got {color})"))),
        _ => color_index(color).map(usize::from),
    }
}

fn to_i32(v: i64) -> i32 {
    v.clamp(i32::MIN.into(), i32::MAX.into()) as i32
}

fn channel(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn library(computer: &ComputerHandle) -> Library {
    Library::new("term")
        .function(
            "write",
            bind(computer, |screen, args| {
                let text = match args.first() {
                    Some(Value::String(s)) => s.clone(),
                    Some(v @ (Value::Integer(_) | Value::Number(_))) => v.to_string(),
                    _ => return Err(super::bad(args, 0, "string")),
                };
                screen.update(|f| f.write(text.as_bytes()));
                Ok(Vec::new())
            }),
        )
        .function(
            "clear",
            bind(computer, |screen, _| {
                screen.update(TerminalFrame::clear);
                Ok(Vec::new())
            }),
        )
        .function(
            "clearLine",
            bind(computer, |screen, _| {
                screen.update(TerminalFrame::clear_line);
                Ok(Vec::new())
            }),
        )
        .function(
            "setCursorPos",
            bind(computer, |screen, args| {
                let (x, y) = (arg_int(args, 0)?, arg_int(args, 1)?);
                screen.update(|f| {
                    f.cursor.x = to_i32(x.saturating_sub(1));
                    f.cursor.y = to_i32(y.saturating_sub(1));
                });
                Ok(Vec::new())
            }),
        )
        .function(
            "getCursorPos",
            bind(computer, |screen, _| {
                let cursor = screen.lock().cursor;
                Ok(vec![cursor.x.saturating_add(1).into(), cursor.y.saturating_add(1).into()])
            }),
        )
        .function(
            "getSize",
            bind(computer, |screen, args| {
                let f = screen.lock();
                let pixels = opt(args, 0, arg_bool)?.unwrap_or(f.mode != GraphicsMode::Text);
                if pixels {
                    Ok(vec![f.pixel_width().into(), f.pixel_height().into()])
                } else {
                    Ok(vec![f.width.into(), f.height.into()])
                }
            }),
        )
        .function(
            "setCursorBlink",
            bind(computer, |screen, args| {
                let blink = arg_bool(args, 0)?;
                screen.update(|f| f.cursor.blink = blink);
                Ok(Vec::new())
            }),
        )
        .function(
            "setTextColor",
            bind(computer, |screen, args| {
                let color = color_index(arg_int(args, 0)?)?;
                screen.update(|f| f.text_fg = color);
                Ok(Vec::new())
            }),
        )
        .function(
            "setBackgroundColor",
            bind(computer, |screen, args| {
                let color = color_index(arg_int(args, 0)?)?;
                screen.update(|f| f.text_bg = color);
                Ok(Vec::new())
            }),
        )
        .function(
            "getTextColor",
            bind(computer, |screen, _| Ok(vec![Value::Integer(color_flag(screen.lock().text_fg))])),
        )
        .function(
            "getBackgroundColor",
            bind(computer, |screen, _| Ok(vec![Value::Integer(color_flag(screen.lock().text_bg))])),
        )
        .function(
            "scroll",
            bind(computer, |screen, args| {
                let lines = to_i32(arg_int(args, 0)?);
                screen.update(|f| f.scroll(lines));
                Ok(Vec::new())
            }),
        )
        .function("isColor", |_| Ok(vec![Value::Bool(true)]))
        .function(
            "setGraphicsMode",
            bind(computer, |screen, args| {
                let mode = match args.first() {
                    Some(Value::Bool(b)) => GraphicsMode::from_u8(u8::from(*b)),
                    Some(v) => v.as_i64().and_then(|n| u8::try_from(n).ok()).and_then(GraphicsMode::from_u8),
                    None => None,
                }
                .ok_or_else(|| ApiError::Failed("Invalid graphics mode".into()))?;
                screen.update(|f| f.set_mode(mode));
                Ok(Vec::new())
            }),
        )
        .function(
            "getGraphicsMode",
            bind(computer, |screen, _| {
                Ok(vec![match screen.lock().mode {
                    GraphicsMode::Text => Value::Bool(false),
                    mode => Value::Integer(mode as i64),
                }])
            }),
        )
        .function(
            "setPixel",
            bind(computer, |screen, args| {
                let (x, y) = (arg_int(args, 0)?, arg_int(args, 1)?);
                let color = arg_int(args, 2)?;
                let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else {
                    return Ok(Vec::new());
                };
                screen.update(|f| {
                    let color = pixel_color(f, color)?;
                    f.set_pixel(x, y, color);
                    Ok(Vec::new())
                })
            }),
        )
        .function(
            "getPixel",
            bind(computer, |screen, args| {
                let (x, y) = (arg_int(args, 0)?, arg_int(args, 1)?);
                let f = screen.lock();
                let pixel = u32::try_from(x)
                    .ok()
                    .zip(u32::try_from(y).ok())
                    .and_then(|(x, y)| f.pixel(x, y));
                Ok(vec![match (pixel, f.mode) {
                    (None, _) => Value::Nil,
                    (Some(p), GraphicsMode::HighRes) => Value::Integer(p as i64),
                    (Some(p), _) => Value::Integer(color_flag(p)),
                }])
            }),
        )
        .function(
            "setPaletteColor",
            bind(computer, |screen, args| {
                let color = arg_int(args, 0)?;
                let rgb = if args.len() >= 4 {
                    Rgb {
                        r: channel(arg_num(args, 1)?),
                        g: channel(arg_num(args, 2)?),
                        b: channel(arg_num(args, 3)?),
                    }
                } else {
                    Rgb::hex((arg_int(args, 1)? & 0xFF_FFFF) as u32)
                };
                screen.update(|f| {
                    let slot = palette_slot(f, color)?;
                    f.palette[slot] = rgb;
                    Ok(Vec::new())
                })
            }),
        )
        .function(
            "getPaletteColor",
            bind(computer, |screen, args| {
                let f = screen.lock();
                let slot = palette_slot(&f, arg_int(args, 0)?)?;
                let Rgb { r, g, b } = f.palette[slot];
                Ok(vec![
                    Value::Number(r as f64 / 255.0),
                    Value::Number(g as f64 / 255.0),
                    Value::Number(b as f64 / 255.0),
                ])
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_flags_map_to_palette_indices() {
        assert_eq!(color_index(1).unwrap(), 0);
        assert_eq!(color_index(0x4000).unwrap(), 14);
        assert_eq!(color_index(0x8000).unwrap(), 15);
        assert!(color_index(3).is_err());
        assert!(color_index(0).is_err());
        assert!(color_index(0x10000).is_err());
        assert_eq!(color_flag(14), 0x4000);
    }

    #[test]
    fn channels_round_to_bytes() {
        assert_eq!(channel(1.0), 255);
        assert_eq!(channel(0.5), 128);
        assert_eq!(channel(-2.0), 0);
    }
}
