//! Hierarchical state machines for computer and debugger lifecycles.

pub mod debug_sm;
pub mod run_level_sm;
