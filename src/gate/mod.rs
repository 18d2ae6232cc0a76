//! Escalation gate: decides per detection set whether remote arbitration is
//! worth its cost.
//!
//! Only the ambiguous confidence band escalates. Low-band evidence is decided
//! locally and high-band evidence is blocked on the fast path; both skip the
//! remote call. Escalations draw from a shared [`TokenBucket`]; an empty
//! bucket degrades the unit to `Skip(RateLimited)` rather than dropping it.

pub mod token_bucket;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::core::config::GateConfig;
use crate::core::evidence::{
    ConfidenceBand, DetectionCandidate, DetectionSet, DetectionSource, EscalationReason,
    GateOutcome, SkipReason,
};
use crate::monitor::telemetry::{Counter, FunnelCounters, TelemetrySample};

pub use token_bucket::TokenBucket;

/// Gate output: the outcome plus the band it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct GateAssessment {
    /// Escalate or skip, with reason.
    pub outcome: GateOutcome,
    /// Band of the set's risk candidates.
    pub band: ConfidenceBand,
}

/// The escalation gate. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct EscalationGate {
    low_trust: f64,
    high_trust: f64,
    risk_labels: HashSet<String>,
    escalate_on_text: bool,
    limiter: Arc<TokenBucket>,
    counters: Arc<FunnelCounters>,
}

impl EscalationGate {
    /// Build from config with injected shared state.
    #[must_use]
    pub fn new(
        config: &GateConfig,
        limiter: Arc<TokenBucket>,
        counters: Arc<FunnelCounters>,
    ) -> Self {
        Self {
            low_trust: config.low_trust,
            high_trust: config.high_trust,
            risk_labels: config
                .risk_labels
                .iter()
                .map(|l| l.trim().to_lowercase())
                .collect(),
            escalate_on_text: config.escalate_on_text,
            limiter,
            counters,
        }
    }

    /// Build from config with a fresh limiter sized by `burst`/`rate_per_sec`.
    #[must_use]
    pub fn from_config(config: &GateConfig, counters: Arc<FunnelCounters>) -> Self {
        let limiter = Arc::new(TokenBucket::new(config.burst, config.rate_per_sec));
        Self::new(config, limiter, counters)
    }

    /// Band of a single confidence value.
    #[must_use]
    pub fn band_for(&self, confidence: f64) -> ConfidenceBand {
        if confidence > self.high_trust {
            ConfidenceBand::High
        } else if confidence >= self.low_trust {
            ConfidenceBand::Ambiguous
        } else {
            ConfidenceBand::Low
        }
    }

    /// Band of a set: the most alarming band among its risk candidates.
    #[must_use]
    pub fn band_of(&self, set: &DetectionSet) -> ConfidenceBand {
        set.candidates()
            .iter()
            .filter(|c| self.is_risk_label(c.label()))
            .map(|c| self.band_for(c.confidence()))
            .max()
            .unwrap_or(ConfidenceBand::None)
    }

    fn is_risk_label(&self, label: &str) -> bool {
        self.risk_labels.is_empty() || self.risk_labels.contains(label)
    }

    /// Decide as of now.
    pub fn decide(&self, set: &DetectionSet) -> GateAssessment {
        self.decide_at(set, Instant::now())
    }

    /// Decide as of `now` (the limiter's clock).
    pub fn decide_at(&self, set: &DetectionSet, now: Instant) -> GateAssessment {
        self.assess(set, now, None)
    }

    /// Decide for a unit that must be finished by `deadline`.
    pub fn decide_until(&self, set: &DetectionSet, deadline: Instant) -> GateAssessment {
        self.assess(set, Instant::now(), Some(deadline))
    }

    /// [`Self::decide_until`] as of `now`. A unit already past its deadline
    /// is skipped before it can take a limiter token.
    pub fn decide_until_at(&self, set: &DetectionSet, now: Instant, deadline: Instant) -> GateAssessment {
        self.assess(set, now, Some(deadline))
    }

    fn assess(&self, set: &DetectionSet, now: Instant, deadline: Option<Instant>) -> GateAssessment {
        self.counters.incr(Counter::GateEvaluated);

        if set.is_unprocessable() {
            return skip(SkipReason::Unprocessable, ConfidenceBand::None);
        }
        if set.is_empty() {
            return skip(SkipReason::EmptySet, ConfidenceBand::None);
        }

        let band = self.band_of(set);
        if band == ConfidenceBand::High {
            self.counters.incr(Counter::GateFastPath);
            return skip(SkipReason::HighBandFastPath, band);
        }

        let Some(reason) = self.escalation_reason(set, band) else {
            return skip(SkipReason::LocalOnly, band);
        };

        if deadline.is_some_and(|d| now >= d) {
            log::warn!("unit {}: deadline elapsed before arbitration ({reason})", set.unit_id());
            return skip(SkipReason::DeadlineElapsed, band);
        }

        if self.limiter.try_acquire_at(now) {
            self.counters.event(
                Counter::GateEscalated,
                TelemetrySample::new("gate", "escalate", format!("{}: {reason}", set.unit_id())),
            );
            GateAssessment {
                outcome: GateOutcome::Escalate(reason),
                band,
            }
        } else {
            self.counters.event(
                Counter::GateRateLimited,
                TelemetrySample::new("gate", "rate_limited", set.unit_id().to_string()),
            );
            log::debug!("unit {} rate-limited at the gate", set.unit_id());
            skip(SkipReason::RateLimited, band)
        }
    }

    fn escalation_reason(&self, set: &DetectionSet, band: ConfidenceBand) -> Option<EscalationReason> {
        if band == ConfidenceBand::Ambiguous {
            // Strongest ambiguous risk candidate; first one wins ties.
            let top = set
                .candidates()
                .iter()
                .filter(|c| self.is_risk_label(c.label()))
                .filter(|c| self.band_for(c.confidence()) == ConfidenceBand::Ambiguous)
                .fold(None::<&DetectionCandidate>, |best, c| match best {
                    Some(b) if b.confidence() >= c.confidence() => Some(b),
                    _ => Some(c),
                })?;
            return Some(EscalationReason::AmbiguousCandidate {
                label: top.label().to_string(),
                confidence: top.confidence(),
            });
        }
        if self.escalate_on_text {
            let text_candidates = set
                .candidates()
                .iter()
                .filter(|c| c.source() == DetectionSource::Text && c.confidence() >= self.low_trust)
                .count();
            if text_candidates > 0 {
                return Some(EscalationReason::TextPresent { text_candidates });
            }
        }
        None
    }
}

fn skip(reason: SkipReason, band: ConfidenceBand) -> GateAssessment {
    GateAssessment {
        outcome: GateOutcome::Skip(reason),
        band,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gate_with(burst: u32, config: impl FnOnce(&mut GateConfig)) -> (EscalationGate, Arc<FunnelCounters>, Instant) {
        let mut cfg = GateConfig::default();
        config(&mut cfg);
        let t0 = Instant::now();
        let counters = FunnelCounters::shared();
        let limiter = Arc::new(TokenBucket::new_at(burst, 1.0, t0));
        (EscalationGate::new(&cfg, limiter, Arc::clone(&counters)), counters, t0)
    }

    fn set(cands: &[(&str, f64)]) -> DetectionSet {
        DetectionSet::new(
            "unit",
            None,
            cands
                .iter()
                .map(|(l, c)| DetectionCandidate::visual(*l, *c).unwrap())
                .collect(),
        )
    }

    #[test]
    fn empty_set_never_escalates() {
        let (gate, counters, t0) = gate_with(5, |_| {});
        let a = gate.decide_at(&set(&[]), t0);
        assert_eq!(a.outcome, GateOutcome::Skip(SkipReason::EmptySet));
        assert_eq!(counters.get(Counter::GateEscalated), 0);
    }

    #[test]
    fn high_band_takes_fast_path() {
        let (gate, counters, t0) = gate_with(5, |_| {});
        let a = gate.decide_at(&set(&[("weapon", 0.92)]), t0);
        assert_eq!(a.outcome, GateOutcome::Skip(SkipReason::HighBandFastPath));
        assert_eq!(a.band, ConfidenceBand::High);
        assert_eq!(counters.get(Counter::GateFastPath), 1);
    }

    #[test]
    fn high_band_wins_over_ambiguous_siblings() {
        let (gate, _, t0) = gate_with(5, |_| {});
        let a = gate.decide_at(&set(&[("knife", 0.5), ("gun", 0.95)]), t0);
        assert_eq!(a.outcome, GateOutcome::Skip(SkipReason::HighBandFastPath));
    }

    #[test]
    fn ambiguous_band_escalates_with_strongest_candidate() {
        let (gate, _, t0) = gate_with(5, |_| {});
        let a = gate.decide_at(&set(&[("knife", 0.4), ("weapon", 0.6), ("gun", 0.6)]), t0);
        assert_eq!(
            a.outcome,
            GateOutcome::Escalate(EscalationReason::AmbiguousCandidate {
                label: "weapon".to_string(),
                confidence: 0.6
            })
        );
        assert_eq!(a.band, ConfidenceBand::Ambiguous);
    }

    #[test]
    fn band_boundaries_are_inclusive_of_ambiguous() {
        let (gate, _, _) = gate_with(1, |_| {});
        assert_eq!(gate.band_for(0.3), ConfidenceBand::Ambiguous);
        assert_eq!(gate.band_for(0.9), ConfidenceBand::Ambiguous);
        assert_eq!(gate.band_for(0.2999), ConfidenceBand::Low);
        assert_eq!(gate.band_for(0.9001), ConfidenceBand::High);
    }

    #[test]
    fn non_risk_labels_do_not_band() {
        let (gate, _, t0) = gate_with(5, |_| {});
        let a = gate.decide_at(&set(&[("person", 0.99), ("cell phone", 0.5)]), t0);
        assert_eq!(a.outcome, GateOutcome::Skip(SkipReason::LocalOnly));
        assert_eq!(a.band, ConfidenceBand::None);
    }

    #[test]
    fn empty_risk_list_means_every_label_counts() {
        let (gate, _, t0) = gate_with(5, |c| c.risk_labels.clear());
        let a = gate.decide_at(&set(&[("person", 0.99)]), t0);
        assert_eq!(a.band, ConfidenceBand::High);
    }

    #[test]
    fn low_band_stays_local() {
        let (gate, counters, t0) = gate_with(5, |_| {});
        let a = gate.decide_at(&set(&[("weapon", 0.2)]), t0);
        assert_eq!(a.outcome, GateOutcome::Skip(SkipReason::LocalOnly));
        assert_eq!(a.band, ConfidenceBand::Low);
        assert_eq!(counters.get(Counter::GateEscalated), 0);
    }

    #[test]
    fn empty_bucket_degrades_to_rate_limited() {
        let (gate, counters, t0) = gate_with(2, |_| {});
        let s = set(&[("weapon", 0.6)]);
        assert!(gate.decide_at(&s, t0).outcome.is_escalate());
        assert!(gate.decide_at(&s, t0).outcome.is_escalate());
        let third = gate.decide_at(&s, t0);
        assert_eq!(third.outcome, GateOutcome::Skip(SkipReason::RateLimited));
        assert_eq!(third.band, ConfidenceBand::Ambiguous);
        assert_eq!(counters.get(Counter::GateRateLimited), 1);
        // One second at 1 token/s refills one escalation.
        assert!(gate.decide_at(&s, t0 + Duration::from_secs(1)).outcome.is_escalate());
    }

    #[test]
    fn late_unit_keeps_its_token() {
        let (gate, counters, t0) = gate_with(1, |_| {});
        let s = set(&[("weapon", 0.6)]);
        let late = gate.decide_until_at(&s, t0 + Duration::from_millis(5), t0);
        assert_eq!(late.outcome, GateOutcome::Skip(SkipReason::DeadlineElapsed));
        assert_eq!(late.band, ConfidenceBand::Ambiguous);
        assert_eq!(counters.get(Counter::GateEscalated), 0);

        // The single token is still there for the next unit.
        let on_time = gate.decide_until_at(&s, t0, t0 + Duration::from_secs(1));
        assert!(on_time.outcome.is_escalate());
        assert_eq!(counters.get(Counter::GateEscalated), 1);
    }

    #[test]
    fn text_escalation_is_opt_in() {
        let text_set = DetectionSet::new(
            "unit",
            None,
            vec![DetectionCandidate::text("text", 0.8, "call 555 for a good time").unwrap()],
        );
        let (off, _, t0) = gate_with(5, |_| {});
        assert_eq!(off.decide_at(&text_set, t0).outcome, GateOutcome::Skip(SkipReason::LocalOnly));

        let (on, _, t0) = gate_with(5, |c| c.escalate_on_text = true);
        assert_eq!(
            on.decide_at(&text_set, t0).outcome,
            GateOutcome::Escalate(EscalationReason::TextPresent { text_candidates: 1 })
        );
    }

    #[test]
    fn unprocessable_sets_skip() {
        let (gate, _, t0) = gate_with(5, |_| {});
        let s = DetectionSet::unprocessable("u", None, "bad input");
        assert_eq!(gate.decide_at(&s, t0).outcome, GateOutcome::Skip(SkipReason::Unprocessable));
    }
}
