//! vcomputer: a host for many sandboxed virtual computers.
//!
//! Each computer runs an untrusted guest script on its own OS thread against
//! a sandboxed API surface. The host supplies everything around the script:
//!
//! - [`dispatcher`]: marshals UI work onto the single owner thread
//! - [`computer`]: the per-computer event loop, lifecycle and handles
//! - [`router`]: platform input to named guest events
//! - [`vfs`]: mount table, path resolution and sandboxed file operations
//! - [`governor`]: the "too long without yielding" watchdog
//! - [`debug`]: breakpoints, stepping and a monitor computer for the debugger
//! - [`remote`]: wire protocols that mirror screens to detached clients
//!
//! The scripting engine itself is an external collaborator behind the
//! [`engine::GuestEngine`] trait.

pub mod api;
pub mod computer;
pub mod config;
pub mod debug;
pub mod dispatcher;
pub mod engine;
pub mod event;
pub mod governor;
pub mod logging;
pub mod paths;
pub mod remote;
pub mod router;
pub mod screen;
pub mod state_machine;
pub mod value;
pub mod vfs;
