//! Cloud arbitration: bounded, deadline-aware remote semantic judgment.
//!
//! The remote model is a black box behind [`RemoteArbiter`]. Everything
//! around it (per-attempt deadlines, retry with jittered backoff, the
//! circuit breaker, and the in-flight ceiling) lives in
//! [`ArbitrationClient`], which always returns a [`Verdict`].
//!
//! [`Verdict`]: crate::core::evidence::Verdict

pub mod breaker;
pub mod client;
#[cfg(feature = "http")]
pub mod http;
pub mod pool;

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::evidence::{CategoryScore, DetectionSet, EscalationReason};

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use client::{ArbitrationClient, RetryPolicy};
pub use pool::{ArbitrationPool, PoolRejected};

/// What one remote attempt is asked to judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbitrationCall {
    /// Unit of work being judged.
    pub unit_id: String,
    /// Opaque reference to the media payload.
    pub media_ref: Option<String>,
    /// Truncated textual summary of the local evidence.
    pub summary: String,
    /// Time the remote side has for this attempt.
    pub timeout: Duration,
}

/// What the remote side answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJudgment {
    /// Reported categories with confidences.
    pub categories: Vec<CategoryScore>,
    /// Free-form explanation.
    pub rationale: String,
}

/// Why one remote attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The attempt exceeded its deadline.
    #[error("remote call timed out")]
    Timeout,
    /// Network, protocol, or server failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The response could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// The remote semantic model. Implementations should honour
/// [`ArbitrationCall::timeout`]; the client enforces it regardless.
pub trait RemoteArbiter: Send + Sync {
    /// Judge one call.
    fn judge(&self, call: &ArbitrationCall) -> Result<RemoteJudgment, RemoteError>;
}

/// Render the local evidence the remote side gets to see, truncated to
/// `max_chars` characters.
#[must_use]
pub fn summarize(set: &DetectionSet, reason: &EscalationReason, max_chars: usize) -> String {
    let mut out = String::new();
    let _ = write!(out, "reason: {reason}");
    let objects: Vec<String> = set
        .candidates()
        .iter()
        .filter(|c| c.recognized_text().is_none())
        .map(|c| format!("{}({:.2})", c.label(), c.confidence()))
        .collect();
    if !objects.is_empty() {
        let _ = write!(out, " | objects: {}", objects.join(", "));
    }
    let texts: Vec<&str> = set.texts().collect();
    if !texts.is_empty() {
        let _ = write!(out, " | text: {}", texts.join(" / "));
    }
    truncate_chars(out, max_chars)
}

fn truncate_chars(mut s: String, max_chars: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max_chars) {
        s.truncate(idx);
    }
    s
}
