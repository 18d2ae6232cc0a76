//! Funnel telemetry: lock-free counters plus an optional event hook.
//!
//! Counters are shared by every worker through one `Arc<FunnelCounters>`;
//! each update is a single relaxed atomic add so the hot path never waits.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// One telemetry event, for hooks that want more than counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySample {
    pub source: &'static str,
    pub kind: &'static str,
    pub detail: String,
}

impl TelemetrySample {
    #[must_use]
    pub fn new(source: &'static str, kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            source,
            kind,
            detail: detail.into(),
        }
    }
}

/// Hook point for ingesting runtime telemetry events.
pub trait TelemetryHook: Send + Sync {
    fn record(&self, sample: TelemetrySample);
}

/// No-op telemetry hook.
#[derive(Debug, Default)]
pub struct NullTelemetryHook;

impl TelemetryHook for NullTelemetryHook {
    fn record(&self, _sample: TelemetrySample) {}
}

/// Counter identity. Keeps call sites typo-proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    GateEvaluated,
    GateEscalated,
    GateRateLimited,
    GateFastPath,
    ArbitrationAttempts,
    ArbitrationSuccess,
    ArbitrationTimeout,
    ArbitrationError,
    ArbitrationCircuitOpen,
    ArbitrationSaturated,
    BreakerOpened,
    DecisionsAllow,
    DecisionsWarn,
    DecisionsBlock,
    Unprocessable,
    AuditFailures,
    MirrorFailures,
    RuleReloads,
    RuleReloadRejected,
}

const COUNTER_COUNT: usize = 19;

impl Counter {
    const fn index(self) -> usize {
        self as usize
    }
}

/// Shared counters with an attached hook.
pub struct FunnelCounters {
    values: [AtomicU64; COUNTER_COUNT],
    hook: Box<dyn TelemetryHook>,
}

impl std::fmt::Debug for FunnelCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunnelCounters")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Default for FunnelCounters {
    fn default() -> Self {
        Self::with_hook(Box::new(NullTelemetryHook))
    }
}

impl FunnelCounters {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn with_hook(hook: Box<dyn TelemetryHook>) -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU64::new(0)),
            hook,
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.values[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Increment and forward a sample to the hook.
    pub fn event(&self, counter: Counter, sample: TelemetrySample) {
        self.incr(counter);
        self.hook.record(sample);
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            gate_evaluated: self.get(Counter::GateEvaluated),
            gate_escalated: self.get(Counter::GateEscalated),
            gate_rate_limited: self.get(Counter::GateRateLimited),
            gate_fast_path: self.get(Counter::GateFastPath),
            arbitration_attempts: self.get(Counter::ArbitrationAttempts),
            arbitration_success: self.get(Counter::ArbitrationSuccess),
            arbitration_timeout: self.get(Counter::ArbitrationTimeout),
            arbitration_error: self.get(Counter::ArbitrationError),
            arbitration_circuit_open: self.get(Counter::ArbitrationCircuitOpen),
            arbitration_saturated: self.get(Counter::ArbitrationSaturated),
            breaker_opened: self.get(Counter::BreakerOpened),
            decisions_allow: self.get(Counter::DecisionsAllow),
            decisions_warn: self.get(Counter::DecisionsWarn),
            decisions_block: self.get(Counter::DecisionsBlock),
            unprocessable: self.get(Counter::Unprocessable),
            audit_failures: self.get(Counter::AuditFailures),
            mirror_failures: self.get(Counter::MirrorFailures),
            rule_reloads: self.get(Counter::RuleReloads),
            rule_reload_rejected: self.get(Counter::RuleReloadRejected),
        }
    }
}

/// Point-in-time copy of every counter, for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub gate_evaluated: u64,
    pub gate_escalated: u64,
    pub gate_rate_limited: u64,
    pub gate_fast_path: u64,
    pub arbitration_attempts: u64,
    pub arbitration_success: u64,
    pub arbitration_timeout: u64,
    pub arbitration_error: u64,
    pub arbitration_circuit_open: u64,
    pub arbitration_saturated: u64,
    pub breaker_opened: u64,
    pub decisions_allow: u64,
    pub decisions_warn: u64,
    pub decisions_block: u64,
    pub unprocessable: u64,
    pub audit_failures: u64,
    pub mirror_failures: u64,
    pub rule_reloads: u64,
    pub rule_reload_rejected: u64,
}

impl CounterSnapshot {
    /// Fraction of gate evaluations that escalated.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn escalation_ratio(&self) -> f64 {
        if self.gate_evaluated == 0 {
            0.0
        } else {
            self.gate_escalated as f64 / self.gate_evaluated as f64
        }
    }
}
