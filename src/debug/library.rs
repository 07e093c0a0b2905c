//! `debugger` library, installed only on a session's monitor computer.

use std::sync::{Arc, Weak};

use super::{CatchClass, DebugError, DebugLink, PauseInfo};
use crate::api::{ApiError, Library, arg_bool, arg_int, arg_str, opt};
use crate::debug::BreakLocation;
use crate::value::Value;

impl From<DebugError> for ApiError {
    fn from(e: DebugError) -> Self {
        ApiError::Failed(e.to_string())
    }
}

fn bind<F>(link: &Weak<DebugLink>, f: F) -> impl Fn(&[Value]) -> Result<Vec<Value>, ApiError> + Send + Sync + 'static
where
    F: Fn(&DebugLink, &[Value]) -> Result<Vec<Value>, ApiError> + Send + Sync + 'static,
{
    let link = link.clone();
    move |args| {
        let link: Arc<DebugLink> = link.upgrade().ok_or(DebugError::Detached)?;
        f(&link, args)
    }
}

fn vars(vars: Vec<(String, Value)>) -> Value {
    Value::Table(vars.into_iter().map(|(k, v)| (Value::String(k), v)).collect())
}

fn pause_info(info: PauseInfo) -> Value {
    let frame = info.frame;
    let opt_line = |l: Option<u32>| l.map_or(Value::Nil, Value::from);
    Value::Table(vec![
        ("reason".into(), Value::String(info.reason)),
        ("source".into(), Value::String(frame.source)),
        ("short_src".into(), Value::String(frame.short_src)),
        ("name".into(), frame.name.map_or(Value::Nil, Value::String)),
        ("what".into(), Value::String(frame.what)),
        ("currentline".into(), opt_line(frame.current_line)),
        ("linedefined".into(), opt_line(frame.line_defined)),
    ])
}

fn done(ok: bool) -> Result<Vec<Value>, ApiError> {
    Ok(vec![Value::Bool(ok)])
}

pub fn debugger_library(link: Weak<DebugLink>) -> Library {
    let l = &link;
    Library::new("debugger")
        .function(
            "setBreakpoint",
            bind(l, |link, args| {
                let id = match args.get(1) {
                    Some(Value::Nil) | None => link.set_function_breakpoint(arg_str(args, 0)?)?,
                    Some(_) => {
                        let line = u32::try_from(arg_int(args, 1)?)
                            .map_err(|_| ApiError::Failed("line out of range".into()))?;
                        link.set_breakpoint(arg_str(args, 0)?, line)?
                    }
                };
                Ok(vec![id.into()])
            }),
        )
        .function(
            "unsetBreakpoint",
            bind(l, |link, args| {
                let removed = u32::try_from(arg_int(args, 0)?)
                    .map(|id| link.unset_breakpoint(id))
                    .unwrap_or(Ok(false))?;
                done(removed)
            }),
        )
        .function(
            "listBreakpoints",
            bind(l, |link, _| {
                let table = link
                    .list_breakpoints()?
                    .into_iter()
                    .map(|b| {
                        let entry = match b.location {
                            BreakLocation::Line { file, line } => Value::Table(vec![
                                ("file".into(), Value::String(file)),
                                ("line".into(), line.into()),
                            ]),
                            BreakLocation::Function { name } => {
                                Value::Table(vec![("func".into(), Value::String(name))])
                            }
                        };
                        (Value::from(b.id), entry)
                    })
                    .collect();
                Ok(vec![Value::Table(table)])
            }),
        )
        .function("step", bind(l, |link, _| done(link.step())))
        .function("stepOut", bind(l, |link, _| done(link.step_out())))
        .function("continue", bind(l, |link, _| done(link.continue_())))
        .function("pause", bind(l, |link, _| done(link.pause())))
        .function(
            "waitForBreak",
            bind(l, |link, _| {
                link.wait_for_break();
                Ok(Vec::new())
            }),
        )
        .function(
            "getInfo",
            bind(l, |link, _| Ok(vec![link.get_info().map_or(Value::Nil, pause_info)])),
        )
        .function("getLocals", bind(l, |link, _| Ok(vec![vars(link.get_locals()?)])))
        .function("getUpvalues", bind(l, |link, _| Ok(vec![vars(link.get_upvalues()?)])))
        .function(
            "setLocal",
            bind(l, |link, args| {
                let value = args.get(1).cloned().unwrap_or_default();
                done(link.set_local(arg_str(args, 0)?, value)?)
            }),
        )
        .function(
            "setUpvalue",
            bind(l, |link, args| {
                let value = args.get(1).cloned().unwrap_or_default();
                done(link.set_upvalue(arg_str(args, 0)?, value)?)
            }),
        )
        .function("run", bind(l, |link, args| Ok(link.run(arg_str(args, 0)?)?)))
        .function(
            "catch",
            bind(l, |link, args| {
                link.catch(arg_str(args, 0)?.parse::<CatchClass>()?);
                Ok(Vec::new())
            }),
        )
        .function(
            "uncatch",
            bind(l, |link, args| {
                link.uncatch(arg_str(args, 0)?.parse::<CatchClass>()?);
                Ok(Vec::new())
            }),
        )
        .function(
            "startProfiling",
            bind(l, |link, args| {
                link.start_profiling(opt(args, 0, arg_bool)?.unwrap_or(true));
                Ok(Vec::new())
            }),
        )
        .function("profile", bind(l, |link, _| Ok(vec![link.profile()])))
        .function("status", bind(l, |link, _| Ok(vec![link.status().into()])))
}
