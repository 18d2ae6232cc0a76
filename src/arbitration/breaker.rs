//! Rolling-window circuit breaker guarding the remote arbiter.
//!
//! ```text
//!   Closed ──(failure ratio ≥ threshold over window)──> Open
//!   Open ──(cooldown elapsed)──> HalfOpen (one probe admitted)
//!   HalfOpen ──(probe succeeds)──> Closed
//!   HalfOpen ──(probe fails)──> Open
//! ```
//!
//! While open, admission is a mutex-guarded timestamp comparison, so a
//! rejected call costs microseconds and never touches the network.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::config::BreakerConfig;
use crate::monitor::telemetry::{Counter, FunnelCounters, TelemetrySample};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// One probe call is testing recovery.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Result of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call while closed.
    Allowed,
    /// The single half-open probe.
    Probe,
    /// Breaker open (or probe already in flight).
    Rejected,
}

impl Admission {
    /// Whether the caller may proceed.
    #[must_use]
    pub fn is_admitted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

/// Shared breaker. Inject one `Arc<CircuitBreaker>` per remote dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    window: Duration,
    min_calls: usize,
    failure_rate: f64,
    cooldown: Duration,
    inner: Mutex<Inner>,
    counters: Arc<FunnelCounters>,
}

impl CircuitBreaker {
    /// Build from config.
    #[must_use]
    pub fn new(config: &BreakerConfig, counters: Arc<FunnelCounters>) -> Self {
        Self {
            window: config.window(),
            min_calls: config.min_calls as usize,
            failure_rate: config.failure_rate,
            cooldown: config.cooldown(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                probe_started: None,
            }),
            counters,
        }
    }

    /// Ask for permission to make one remote attempt.
    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    /// Ask for permission as of `now`.
    pub fn admit_at(&self, now: Instant) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|t| now.saturating_duration_since(t) >= self.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_started = Some(now);
                    log::info!("arbitration breaker half-open: admitting probe");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                // A probe that never reported back must not wedge the breaker.
                let stale = inner
                    .probe_started
                    .is_none_or(|t| now.saturating_duration_since(t) >= self.cooldown);
                if stale {
                    inner.probe_started = Some(now);
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Report the outcome of an admitted attempt.
    pub fn record(&self, admission: Admission, success: bool) {
        self.record_at(Instant::now(), admission, success);
    }

    /// Report an outcome as of `now`.
    pub fn record_at(&self, now: Instant, admission: Admission, success: bool) {
        let mut inner = self.inner.lock();
        match admission {
            Admission::Rejected => {}
            Admission::Probe => {
                inner.probe_started = None;
                if success {
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                    inner.outcomes.clear();
                    log::info!("arbitration breaker closed after successful probe");
                } else {
                    self.open(&mut inner, now, "probe failed");
                }
            }
            Admission::Allowed => {
                inner.outcomes.push_back((now, success));
                self.prune(&mut inner, now);
                if inner.state != BreakerState::Closed {
                    return;
                }
                let total = inner.outcomes.len();
                let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count();
                #[allow(clippy::cast_precision_loss)]
                let ratio = if total == 0 {
                    0.0
                } else {
                    failures as f64 / total as f64
                };
                if total >= self.min_calls && ratio >= self.failure_rate {
                    self.open(&mut inner, now, &format!("{failures}/{total} failures in window"));
                }
            }
        }
    }

    /// Give back an admission that never reached the remote side. A returned
    /// probe lets the next caller probe immediately.
    pub fn abandon(&self, admission: Admission) {
        if admission == Admission::Probe {
            let mut inner = self.inner.lock();
            if inner.state == BreakerState::HalfOpen {
                inner.probe_started = None;
            }
        }
    }

    /// Current state as of `now`, without admitting anything.
    #[must_use]
    pub fn state_at(&self, now: Instant) -> BreakerState {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open
                if inner
                    .opened_at
                    .is_none_or(|t| now.saturating_duration_since(t) >= self.cooldown) =>
            {
                BreakerState::HalfOpen
            }
            state => state,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    fn open(&self, inner: &mut Inner, now: Instant, why: &str) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.outcomes.clear();
        self.counters.event(
            Counter::BreakerOpened,
            TelemetrySample::new("breaker", "open", why.to_string()),
        );
        log::warn!(
            "arbitration breaker opened ({why}); short-circuiting for {:?}",
            self.cooldown
        );
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some((t, _)) = inner.outcomes.front() {
            if now.saturating_duration_since(*t) > self.window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}
