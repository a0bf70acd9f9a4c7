//! Latch CLI library: command implementations and terminal output helpers.

pub mod commands;
pub mod output;
