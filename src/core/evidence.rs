//! Evidence model shared by every funnel stage: detections, verdicts, gate
//! outcomes and decisions.
//!
//! Everything here is data. Values are created by exactly one stage and read
//! by the stages after it; cross-stage sharing goes through `Arc` so a
//! decision's evidence snapshot is the very object the earlier stages saw.

#![allow(missing_docs)]

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ──────────────────── detections ────────────────────

/// Which local detector produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    /// Object detector output.
    Visual,
    /// OCR output.
    Text,
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Visual => write!(f, "visual"),
            Self::Text => write!(f, "text"),
        }
    }
}

/// Where in the media unit a candidate was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    /// Pixel-space bounding box.
    BoundingBox { x: f32, y: f32, width: f32, height: f32 },
    /// Character span inside recognized text.
    TextSpan { start: usize, end: usize },
    /// Detector reported no position.
    #[default]
    Unlocated,
}

/// Why a raw detection could not become a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateError {
    #[error("empty class label")]
    EmptyLabel,
    #[error("confidence {0} is not a finite value in [0, 1]")]
    ConfidenceOutOfRange(String),
}

/// One locally detected signal. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    label: String,
    confidence: f64,
    locator: Locator,
    timestamp_ms: u64,
    source: DetectionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl DetectionCandidate {
    /// Build a candidate, rejecting empty labels and confidences outside [0, 1].
    pub fn new(
        label: impl Into<String>,
        confidence: f64,
        locator: Locator,
        timestamp_ms: u64,
        source: DetectionSource,
        text: Option<String>,
    ) -> Result<Self, CandidateError> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(CandidateError::EmptyLabel);
        }
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(CandidateError::ConfidenceOutOfRange(confidence.to_string()));
        }
        Ok(Self {
            label,
            confidence,
            locator,
            timestamp_ms,
            source,
            text,
        })
    }

    /// Shorthand for an unlocated visual candidate.
    pub fn visual(label: impl Into<String>, confidence: f64) -> Result<Self, CandidateError> {
        Self::new(
            label,
            confidence,
            Locator::Unlocated,
            0,
            DetectionSource::Visual,
            None,
        )
    }

    /// Shorthand for an OCR candidate carrying its recognized text.
    pub fn text(
        label: impl Into<String>,
        confidence: f64,
        text: impl Into<String>,
    ) -> Result<Self, CandidateError> {
        Self::new(
            label,
            confidence,
            Locator::Unlocated,
            0,
            DetectionSource::Text,
            Some(text.into()),
        )
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    #[must_use]
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    #[must_use]
    pub fn source(&self) -> DetectionSource {
        self.source
    }

    #[must_use]
    pub fn recognized_text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

/// Normalized local evidence for one unit of work (frame or session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    unit_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_ref: Option<String>,
    candidates: Vec<DetectionCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unprocessable: Option<String>,
}

impl DetectionSet {
    /// A well-formed set. Candidate order is preserved.
    #[must_use]
    pub fn new(
        unit_id: impl Into<String>,
        media_ref: Option<String>,
        candidates: Vec<DetectionCandidate>,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            media_ref,
            candidates,
            unprocessable: None,
        }
    }

    /// An empty set for a unit whose detector input was rejected.
    #[must_use]
    pub fn unprocessable(
        unit_id: impl Into<String>,
        media_ref: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            media_ref,
            candidates: Vec::new(),
            unprocessable: Some(reason.into()),
        }
    }

    #[must_use]
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    #[must_use]
    pub fn media_ref(&self) -> Option<&str> {
        self.media_ref.as_deref()
    }

    #[must_use]
    pub fn candidates(&self) -> &[DetectionCandidate] {
        &self.candidates
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    #[must_use]
    pub fn is_unprocessable(&self) -> bool {
        self.unprocessable.is_some()
    }

    #[must_use]
    pub fn unprocessable_reason(&self) -> Option<&str> {
        self.unprocessable.as_deref()
    }

    /// Highest candidate confidence, `None` for an empty set.
    #[must_use]
    pub fn max_confidence(&self) -> Option<f64> {
        self.candidates
            .iter()
            .map(DetectionCandidate::confidence)
            .reduce(f64::max)
    }

    /// Highest confidence among candidates with the given label.
    #[must_use]
    pub fn label_confidence(&self, label: &str) -> Option<f64> {
        self.candidates
            .iter()
            .filter(|c| c.label == label)
            .map(DetectionCandidate::confidence)
            .reduce(f64::max)
    }

    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.candidates.iter().any(|c| c.label == label)
    }

    /// Recognized text of every text-sourced candidate, in order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.candidates
            .iter()
            .filter_map(DetectionCandidate::recognized_text)
    }
}

// ──────────────────── gate ────────────────────

/// Confidence band of a detection set with respect to the trust bounds.
///
/// Ordered so that `max` picks the most alarming band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// No risk-bearing candidate present.
    None,
    /// Below the low-trust bound: decided locally.
    Low,
    /// Between the bounds: worth a remote opinion.
    Ambiguous,
    /// Above the high-trust bound: blocked without escalation.
    High,
}

impl fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Low => write!(f, "low"),
            Self::Ambiguous => write!(f, "ambiguous"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Why the gate escalated a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    /// A risk candidate landed in the ambiguous band.
    AmbiguousCandidate { label: String, confidence: f64 },
    /// Recognized text present and text escalation enabled.
    TextPresent { text_candidates: usize },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmbiguousCandidate { label, confidence } => {
                write!(f, "ambiguous {label} ({confidence:.2})")
            }
            Self::TextPresent { text_candidates } => {
                write!(f, "{text_candidates} text candidate(s)")
            }
        }
    }
}

/// Why the gate did not escalate a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptySet,
    Unprocessable,
    /// Every risk candidate is below the low-trust bound.
    LocalOnly,
    /// A risk candidate is above the high-trust bound.
    HighBandFastPath,
    /// Escalation was warranted but the token bucket was empty.
    RateLimited,
    /// Escalation was warranted but the unit deadline had already passed.
    DeadlineElapsed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::EmptySet => "empty_set",
            Self::Unprocessable => "unprocessable",
            Self::LocalOnly => "local_only",
            Self::HighBandFastPath => "high_band_fast_path",
            Self::RateLimited => "rate_limited",
            Self::DeadlineElapsed => "deadline_elapsed",
        };
        f.write_str(text)
    }
}

/// Gate decision for one detection set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum GateOutcome {
    Escalate(EscalationReason),
    Skip(SkipReason),
}

impl GateOutcome {
    #[must_use]
    pub fn is_escalate(&self) -> bool {
        matches!(self, Self::Escalate(_))
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Skip(SkipReason::RateLimited))
    }

    #[must_use]
    pub fn is_deadline_elapsed(&self) -> bool {
        matches!(self, Self::Skip(SkipReason::DeadlineElapsed))
    }
}

/// A request for remote arbitration. Not `Clone`: it is consumed exactly once.
#[derive(Debug)]
pub struct EscalationRequest {
    pub detections: Arc<DetectionSet>,
    pub reason: EscalationReason,
    pub media_ref: Option<String>,
    pub deadline: Instant,
}

impl EscalationRequest {
    #[must_use]
    pub fn new(detections: Arc<DetectionSet>, reason: EscalationReason, deadline: Instant) -> Self {
        let media_ref = detections.media_ref().map(str::to_string);
        Self {
            detections,
            reason,
            media_ref,
            deadline,
        }
    }
}

// ──────────────────── verdicts ────────────────────

/// Outcome class of a remote arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Success,
    Timeout,
    Error,
    CircuitOpen,
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
            Self::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

/// One semantic category reported by the remote arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: String,
    pub confidence: f64,
}

impl CategoryScore {
    #[must_use]
    pub fn new(category: impl Into<String>, confidence: f64) -> Self {
        Self {
            category: category.into(),
            confidence,
        }
    }
}

/// Structured output of remote arbitration. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    status: VerdictStatus,
    categories: Vec<CategoryScore>,
    rationale: String,
    latency_ms: u64,
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

impl Verdict {
    #[must_use]
    pub fn success(
        categories: Vec<CategoryScore>,
        rationale: impl Into<String>,
        latency_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            status: VerdictStatus::Success,
            categories,
            rationale: rationale.into(),
            latency_ms,
            attempts,
            failure: None,
        }
    }

    /// A degraded verdict. Carries no categories.
    #[must_use]
    pub fn failed(
        status: VerdictStatus,
        failure: impl Into<String>,
        latency_ms: u64,
        attempts: u32,
    ) -> Self {
        debug_assert!(status != VerdictStatus::Success);
        Self {
            status,
            categories: Vec::new(),
            rationale: String::new(),
            latency_ms,
            attempts,
            failure: Some(failure.into()),
        }
    }

    #[must_use]
    pub fn status(&self) -> VerdictStatus {
        self.status
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == VerdictStatus::Success
    }

    #[must_use]
    pub fn categories(&self) -> &[CategoryScore] {
        &self.categories
    }

    #[must_use]
    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        self.latency_ms
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    #[must_use]
    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c.category == category)
    }

    #[must_use]
    pub fn category_confidence(&self, category: &str) -> Option<f64> {
        self.categories
            .iter()
            .filter(|c| c.category == category)
            .map(|c| c.confidence)
            .reduce(f64::max)
    }

    /// Highest category confidence, `None` when no categories were reported.
    #[must_use]
    pub fn top_confidence(&self) -> Option<f64> {
        self.categories.iter().map(|c| c.confidence).reduce(f64::max)
    }
}

// ──────────────────── decisions ────────────────────

/// Final moderation action. Ordered by restrictiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[serde(alias = "ALLOW")]
    Allow,
    #[serde(alias = "WARN")]
    Warn,
    #[serde(alias = "BLOCK")]
    Block,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Warn => write!(f, "WARN"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// How deep the evidence behind a decision went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTier {
    /// Local detectors only, by choice.
    Local,
    /// Remote arbitration returned a usable verdict.
    Escalated,
    /// Remote arbitration was wanted but unavailable.
    Degraded,
}

/// Everything the policy engine saw. Sufficient to replay the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSnapshot {
    pub detections: Arc<DetectionSet>,
    pub verdict: Option<Arc<Verdict>>,
    pub band: ConfidenceBand,
    pub gate: GateOutcome,
}

impl EvidenceSnapshot {
    #[must_use]
    pub fn new(
        detections: Arc<DetectionSet>,
        verdict: Option<Arc<Verdict>>,
        band: ConfidenceBand,
        gate: GateOutcome,
    ) -> Self {
        Self {
            detections,
            verdict,
            band,
            gate,
        }
    }

    #[must_use]
    pub fn rate_limited(&self) -> bool {
        self.gate.is_rate_limited()
    }

    #[must_use]
    pub fn deadline_elapsed(&self) -> bool {
        self.gate.is_deadline_elapsed()
    }

    #[must_use]
    pub fn verdict_ok(&self) -> bool {
        self.verdict.as_deref().is_some_and(Verdict::is_success)
    }

    #[must_use]
    pub fn tier(&self) -> AuditTier {
        if self.verdict_ok() {
            AuditTier::Escalated
        } else if self.verdict.is_some()
            || matches!(
                self.gate,
                GateOutcome::Skip(SkipReason::RateLimited | SkipReason::DeadlineElapsed)
            )
        {
            AuditTier::Degraded
        } else {
            AuditTier::Local
        }
    }
}

/// The single final outcome for one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub unit_id: String,
    pub action: Action,
    pub matched_rule_id: String,
    /// Every rule whose condition held, in evaluation order.
    pub matched_rules: Vec<String>,
    pub severity: u8,
    pub tier: AuditTier,
    pub evidence: EvidenceSnapshot,
    pub policy_version: String,
    pub policy_generation: u64,
    pub policy_fingerprint: String,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

impl Decision {
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.decided_at.is_some() && !self.policy_version.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_rejects_out_of_range_confidence() {
        assert!(DetectionCandidate::visual("weapon", 1.2).is_err());
        assert!(DetectionCandidate::visual("weapon", f64::NAN).is_err());
        assert_eq!(
            DetectionCandidate::visual("  ", 0.5),
            Err(CandidateError::EmptyLabel)
        );
        assert!(DetectionCandidate::visual("weapon", 1.0).is_ok());
    }

    #[test]
    fn set_aggregates_label_confidence() {
        let set = DetectionSet::new(
            "u1",
            None,
            vec![
                DetectionCandidate::visual("knife", 0.4).unwrap(),
                DetectionCandidate::visual("knife", 0.7).unwrap(),
                DetectionCandidate::visual("person", 0.9).unwrap(),
            ],
        );
        assert_eq!(set.label_confidence("knife"), Some(0.7));
        assert_eq!(set.max_confidence(), Some(0.9));
        assert_eq!(set.label_confidence("gun"), None);
    }

    #[test]
    fn action_order_is_by_restrictiveness() {
        assert!(Action::Block > Action::Warn);
        assert!(Action::Warn > Action::Allow);
        assert_eq!([Action::Warn, Action::Block, Action::Allow].iter().max(), Some(&Action::Block));
    }

    #[test]
    fn tier_reflects_verdict_and_gate() {
        let set = Arc::new(DetectionSet::new("u", None, Vec::new()));
        let local = EvidenceSnapshot::new(
            Arc::clone(&set),
            None,
            ConfidenceBand::None,
            GateOutcome::Skip(SkipReason::EmptySet),
        );
        assert_eq!(local.tier(), AuditTier::Local);

        let limited = EvidenceSnapshot::new(
            Arc::clone(&set),
            None,
            ConfidenceBand::Ambiguous,
            GateOutcome::Skip(SkipReason::RateLimited),
        );
        assert_eq!(limited.tier(), AuditTier::Degraded);
        assert!(limited.rate_limited());

        let timed_out = EvidenceSnapshot::new(
            set,
            Some(Arc::new(Verdict::failed(VerdictStatus::Timeout, "deadline", 10, 3))),
            ConfidenceBand::Ambiguous,
            GateOutcome::Escalate(EscalationReason::TextPresent { text_candidates: 1 }),
        );
        assert_eq!(timed_out.tier(), AuditTier::Degraded);
        assert!(!timed_out.verdict_ok());
    }

    #[test]
    fn verdict_serializes_status_snake_case() {
        let v = Verdict::failed(VerdictStatus::CircuitOpen, "breaker open", 0, 0);
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"status\":\"circuit_open\""));
        let back: Verdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
