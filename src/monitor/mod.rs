//! Runtime monitoring: shared funnel counters and telemetry hooks.

pub mod telemetry;
