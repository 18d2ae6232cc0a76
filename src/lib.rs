//! Funnel decision core for streaming media moderation.
//!
//! Units flow Collector → Gate → [Arbitration] → Policy → Aggregator. Cheap
//! local evidence decides most units; only ambiguous ones pay for a bounded,
//! deadline-aware remote judgment. Every unit ends as exactly one audited
//! [`Decision`](core::evidence::Decision).

pub mod aggregator;
pub mod arbitration;
pub mod collector;
pub mod core;
pub mod gate;
pub mod logger;
pub mod monitor;
pub mod pipeline;
pub mod policy;

#[cfg(feature = "daemon")]
pub mod daemon;

#[cfg(feature = "cli")]
pub mod cli_app;
