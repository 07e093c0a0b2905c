//! `os` library: identity, events, timers and clocks.

use std::time::Duration;

use chrono::{Local, Utc};

use crate::computer::ComputerHandle;
use crate::event::Event;
use crate::value::Value;

use super::{ApiError, Library, arg_int, arg_num, arg_str, opt};

pub fn library(computer: &ComputerHandle) -> Library {
    let id = computer.id();
    let (queue, timer, cancel, clock, off, reboot) = (
        computer.clone(),
        computer.clone(),
        computer.clone(),
        computer.clone(),
        computer.clone(),
        computer.clone(),
    );

    Library::new("os")
        .function("getComputerID", move |_| Ok(vec![id.into()]))
        .function("queueEvent", move |args| {
            let name = arg_str(args, 0)?;
            if !queue.queue_named(Event::new(name, args[1..].to_vec())) {
                return Err(ApiError::Gone);
            }
            Ok(Vec::new())
        })
        .function("startTimer", move |args| {
            let secs = arg_num(args, 0)?;
            if !secs.is_finite() {
                return Err(ApiError::Failed("timer duration must be finite".into()));
            }
            let shared = timer.upgrade().ok_or(ApiError::Gone)?;
            let id = shared.start_timer(timer.clone(), Duration::from_secs_f64(secs.max(0.0)));
            Ok(vec![id.into()])
        })
        .function("cancelTimer", move |args| {
            let id = arg_int(args, 0)?;
            let shared = cancel.upgrade().ok_or(ApiError::Gone)?;
            if let Ok(id) = u32::try_from(id) {
                shared.cancel_timer(id);
            }
            Ok(Vec::new())
        })
        .function("clock", move |_| {
            let shared = clock.upgrade().ok_or(ApiError::Gone)?;
            Ok(vec![Value::Number(shared.uptime().as_secs_f64())])
        })
        .function("epoch", |args| {
            let millis = match opt(args, 0, arg_str)?.unwrap_or("utc") {
                "utc" => Utc::now().timestamp_millis(),
                "local" => Local::now().naive_local().and_utc().timestamp_millis(),
                other => return Err(ApiError::Failed(format!("Unsupported operation: {other}"))),
            };
            Ok(vec![Value::Integer(millis)])
        })
        .function("shutdown", move |_| {
            off.shutdown();
            Ok(Vec::new())
        })
        .function("reboot", move |_| {
            reboot.reboot();
            Ok(Vec::new())
        })
}
