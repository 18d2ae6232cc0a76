//! Daemon subsystem: the streaming stdin loop and signal handling.

pub mod loop_main;
pub mod signals;
