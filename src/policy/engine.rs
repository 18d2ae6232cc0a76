//! Rule evaluation.
//!
//! [`evaluate`] is a pure function of the evidence and one rule-set
//! generation: no clock, no I/O, no shared state. Timestamps are stamped
//! later by the aggregator.

use std::sync::Arc;

use serde::Serialize;

use super::rules::{NO_MATCH_RULE_ID, PolicyRule, RuleSet};
use super::store::RuleStore;
use crate::core::evidence::{Action, Decision, EvidenceSnapshot};

/// Evaluate `rules` against `evidence`.
///
/// Rules run in `(priority, id)` order. A matching short-circuit rule ends
/// evaluation and decides alone. Otherwise every match is collected and the
/// most restrictive action wins; ties go to the higher severity, then to the
/// earlier rule. No match yields ALLOW from the synthetic `no-match` rule.
#[must_use]
pub fn evaluate(evidence: EvidenceSnapshot, rules: &RuleSet) -> Decision {
    let mut matched: Vec<&PolicyRule> = Vec::new();
    let mut winner: Option<&PolicyRule> = None;

    for rule in rules.rules() {
        if !rule.condition.holds(&evidence) {
            continue;
        }
        matched.push(rule);
        if rule.short_circuit {
            winner = Some(rule);
            break;
        }
        winner = match winner {
            Some(best) if (best.action, best.severity) >= (rule.action, rule.severity) => Some(best),
            _ => Some(rule),
        };
    }

    let (action, rule_id, severity) = winner.map_or_else(
        || (Action::Allow, NO_MATCH_RULE_ID.to_string(), 0),
        |r| (r.action, r.id.clone(), r.severity),
    );

    Decision {
        unit_id: evidence.detections.unit_id().to_string(),
        action,
        matched_rule_id: rule_id,
        matched_rules: matched.iter().map(|r| r.id.clone()).collect(),
        severity,
        tier: evidence.tier(),
        evidence,
        policy_version: rules.version().to_string(),
        policy_generation: rules.generation(),
        policy_fingerprint: rules.fingerprint().to_string(),
        decided_at: None,
    }
}

/// Per-rule trace for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleTrace {
    pub id: String,
    pub priority: i64,
    pub when: String,
    pub action: Action,
    pub severity: u8,
    pub matched: bool,
    /// Set on rules after a short-circuit match.
    pub skipped: bool,
}

/// Walk every rule and report whether it matched, without deciding.
#[must_use]
pub fn explain(evidence: &EvidenceSnapshot, rules: &RuleSet) -> Vec<RuleTrace> {
    let mut stopped = false;
    rules
        .rules()
        .iter()
        .map(|rule| {
            let matched = !stopped && rule.condition.holds(evidence);
            let trace = RuleTrace {
                id: rule.id.clone(),
                priority: rule.priority,
                when: rule.when.clone(),
                action: rule.action,
                severity: rule.severity,
                matched,
                skipped: stopped,
            };
            if matched && rule.short_circuit {
                stopped = true;
            }
            trace
        })
        .collect()
}

/// Evaluator bound to a hot-reloadable store.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    store: Arc<RuleStore>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Evaluate against the generation live at call time.
    #[must_use]
    pub fn decide(&self, evidence: EvidenceSnapshot) -> Decision {
        let rules = self.store.snapshot();
        evaluate(evidence, &rules)
    }
}
