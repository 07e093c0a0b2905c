//! The sandboxed API surface handed to every guest engine at boot.
//!
//! Each library is a table of named host functions. Functions capture a
//! [`ComputerHandle`], never the computer itself, so a function the engine
//! keeps around after teardown fails with [`ApiError::Gone`].
//!
//! Submodules:
//! - `fs`: file access through the computer's mount table
//! - `os`: ids, events, timers and clocks
//! - `term`: the terminal screen
//! - `mounter`: guest-driven mount changes

pub mod fs;
pub mod mounter;
pub mod os;
pub mod term;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::computer::{ComputerHandle, HostContext};
use crate::value::Value;
use crate::vfs::FsError;

/// Failures returned to the guest as ordinary errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad argument #{index} (expected {expected}, got {got})")]
    BadArgument {
        index: usize,
        expected: &'static str,
        got: &'static str,
    },
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("{0}")]
    Failed(String),
    #[error("attempt to call unknown function {0}")]
    NoSuchFunction(String),
    #[error("computer is no longer running")]
    Gone,
}

pub type ApiFn = Arc<dyn Fn(&[Value]) -> Result<Vec<Value>, ApiError> + Send + Sync>;

/// A named table of host functions.
#[derive(Clone, Default)]
pub struct Library {
    name: String,
    functions: BTreeMap<String, ApiFn>,
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Library {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), functions: BTreeMap::new() }
    }

    pub fn function<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, ApiError> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, function: &str) -> Option<&ApiFn> {
        self.functions.get(function)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// Every library installed into one engine.
#[derive(Clone, Default, Debug)]
pub struct ApiSurface {
    libraries: BTreeMap<String, Library>,
}

impl ApiSurface {
    /// Install `library`, replacing one of the same name.
    pub fn install(&mut self, library: Library) {
        self.libraries.insert(library.name.clone(), library);
    }

    pub fn library(&self, name: &str) -> Option<&Library> {
        self.libraries.get(name)
    }

    pub fn library_names(&self) -> impl Iterator<Item = &str> {
        self.libraries.keys().map(String::as_str)
    }

    pub fn call(&self, library: &str, function: &str, args: &[Value]) -> Result<Vec<Value>, ApiError> {
        let f = self
            .libraries
            .get(library)
            .and_then(|lib| lib.get(function))
            .ok_or_else(|| ApiError::NoSuchFunction(format!("{library}.{function}")))?;
        f(args)
    }
}

/// The libraries every computer gets.
pub fn default_surface(ctx: &HostContext, computer: &ComputerHandle) -> ApiSurface {
    let mut surface = ApiSurface::default();
    surface.install(fs::library(computer));
    surface.install(os::library(computer));
    surface.install(term::library(computer));
    surface.install(mounter::library(ctx, computer));
    surface
}

// ---------------------------------------------------------------------------
// Argument helpers (1-based argument numbers in messages)
// ---------------------------------------------------------------------------

fn bad(args: &[Value], i: usize, expected: &'static str) -> ApiError {
    ApiError::BadArgument {
        index: i + 1,
        expected,
        got: args.get(i).map_or("no value", Value::type_name),
    }
}

pub(crate) fn arg_str(args: &[Value], i: usize) -> Result<&str, ApiError> {
    args.get(i).and_then(Value::as_str).ok_or_else(|| bad(args, i, "string"))
}

/// Integers pass through; other numbers are floored and must fit an `i64`.
pub(crate) fn arg_int(args: &[Value], i: usize) -> Result<i64, ApiError> {
    let n = match args.get(i) {
        Some(Value::Integer(n)) => return Ok(*n),
        Some(Value::Number(n)) => n.floor(),
        _ => return Err(bad(args, i, "number")),
    };
    // `i64::MAX as f64` rounds up to 2^63, which is already out of range.
    if !n.is_finite() || n < i64::MIN as f64 || n >= i64::MAX as f64 {
        return Err(ApiError::Failed(format!("bad argument #{} (number {n:e} out of range)", i + 1)));
    }
    Ok(n as i64)
}

pub(crate) fn arg_num(args: &[Value], i: usize) -> Result<f64, ApiError> {
    args.get(i).and_then(Value::as_f64).ok_or_else(|| bad(args, i, "number"))
}

pub(crate) fn arg_bool(args: &[Value], i: usize) -> Result<bool, ApiError> {
    args.get(i).and_then(Value::as_bool).ok_or_else(|| bad(args, i, "boolean"))
}

/// Missing and nil arguments become `None`.
pub(crate) fn opt<'a, T>(
    args: &'a [Value],
    i: usize,
    get: fn(&'a [Value], usize) -> Result<T, ApiError>,
) -> Result<Option<T>, ApiError> {
    match args.get(i) {
        None | Some(Value::Nil) => Ok(None),
        Some(_) => get(args, i).map(Some),
    }
}
