//! Core data model, configuration, and error types.

pub mod config;
pub mod errors;
pub mod evidence;
