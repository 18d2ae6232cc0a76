//! Rule documents and compiled, ordered rule sets.
//!
//! A document is TOML or JSON:
//!
//! ```toml
//! version = "2026-10-01"
//! builtin_rules = true
//! unprocessable_action = "block"
//!
//! [[rules]]
//! id = "weapon-confirmed"
//! priority = 1
//! when = '"weapon" in categories AND confidence > 0.7'
//! action = "block"
//! severity = 90
//! short_circuit = true
//! ```
//!
//! Compilation validates everything up front, so a [`RuleSet`] that exists
//! can always be evaluated.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::condition::{Condition, Flag};
use crate::core::errors::{CfnError, Result};
use crate::core::evidence::{Action, ConfidenceBand};

/// Reserved id prefix for built-in rules.
pub const BUILTIN_PREFIX: &str = "builtin.";
/// Synthetic rule id reported when nothing matched.
pub const NO_MATCH_RULE_ID: &str = "no-match";
/// Priority of built-in rules: after every document rule.
pub const BUILTIN_PRIORITY: i64 = i64::MAX;
/// Highest allowed severity.
pub const MAX_SEVERITY: u8 = 100;

/// Version label of the rule set used when no document is loaded.
pub const BUILTIN_VERSION: &str = "builtin";

/// Serialized rule document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDocument {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_true")]
    pub builtin_rules: bool,
    #[serde(default = "default_unprocessable_action")]
    pub unprocessable_action: Action,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

impl Default for RuleDocument {
    fn default() -> Self {
        Self {
            version: default_version(),
            builtin_rules: true,
            unprocessable_action: default_unprocessable_action(),
            rules: Vec::new(),
        }
    }
}

/// One rule as written in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    pub id: String,
    #[serde(default)]
    pub priority: i64,
    pub when: String,
    pub action: Action,
    #[serde(default)]
    pub severity: u8,
    #[serde(default)]
    pub short_circuit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_version() -> String {
    "unversioned".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_unprocessable_action() -> Action {
    Action::Block
}

/// Document encoding, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFormat {
    Toml,
    Json,
}

impl RuleFormat {
    /// Format for `path`, by extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            _ => Err(CfnError::UnsupportedRuleFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub id: String,
    pub priority: i64,
    pub condition: Condition,
    /// Condition source text, kept for explanations.
    pub when: String,
    pub action: Action,
    pub severity: u8,
    pub short_circuit: bool,
    pub description: Option<String>,
}

impl PolicyRule {
    #[must_use]
    pub fn is_builtin(&self) -> bool {
        self.id.starts_with(BUILTIN_PREFIX)
    }
}

/// One immutable generation of rules, sorted by `(priority, id)`.
#[derive(Debug, Clone)]
pub struct RuleSet {
    version: String,
    generation: u64,
    fingerprint: String,
    unprocessable_action: Action,
    rules: Vec<PolicyRule>,
}

impl RuleSet {
    /// The built-in rules alone.
    #[must_use]
    pub fn builtin_only() -> Self {
        let doc = RuleDocument {
            version: BUILTIN_VERSION.to_string(),
            ..RuleDocument::default()
        };
        let unprocessable_action = doc.unprocessable_action;
        Self {
            version: doc.version,
            generation: 0,
            fingerprint: fingerprint(BUILTIN_VERSION.as_bytes()),
            unprocessable_action,
            rules: sorted(builtin_rules(unprocessable_action)),
        }
    }

    /// Parse and compile a document held in memory.
    pub fn parse(raw: &str, format: RuleFormat) -> Result<Self> {
        let doc: RuleDocument = match format {
            RuleFormat::Toml => toml::from_str(raw).map_err(|e| CfnError::InvalidRules {
                details: format!("toml: {e}"),
            })?,
            RuleFormat::Json => serde_json::from_str(raw).map_err(|e| CfnError::InvalidRules {
                details: format!("json: {e}"),
            })?,
        };
        Self::compile(doc, fingerprint(raw.as_bytes()))
    }

    /// Read, parse and compile a document file.
    pub fn load(path: &Path) -> Result<Self> {
        let format = RuleFormat::from_path(path)?;
        let raw = std::fs::read_to_string(path).map_err(|e| CfnError::io(path, e))?;
        Self::parse(&raw, format)
    }

    /// Validate and compile a document. Generation starts at 0; the store
    /// assigns real generations on install.
    pub fn compile(doc: RuleDocument, fingerprint: String) -> Result<Self> {
        if doc.version.trim().is_empty() {
            return Err(CfnError::InvalidRules {
                details: "version must not be empty".to_string(),
            });
        }
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(doc.rules.len() + 3);
        for entry in doc.rules {
            let id = entry.id.trim().to_string();
            if id.is_empty() {
                return Err(CfnError::InvalidRules {
                    details: "rule with empty id".to_string(),
                });
            }
            if id.starts_with(BUILTIN_PREFIX) || id == NO_MATCH_RULE_ID {
                return Err(CfnError::InvalidRules {
                    details: format!("rule id `{id}` is reserved"),
                });
            }
            if !seen.insert(id.clone()) {
                return Err(CfnError::InvalidRules {
                    details: format!("duplicate rule id `{id}`"),
                });
            }
            if entry.severity > MAX_SEVERITY {
                return Err(CfnError::InvalidRules {
                    details: format!("rule `{id}`: severity {} exceeds {MAX_SEVERITY}", entry.severity),
                });
            }
            let condition =
                Condition::parse(&entry.when).map_err(|e| CfnError::InvalidCondition {
                    rule_id: id.clone(),
                    details: e.to_string(),
                })?;
            rules.push(PolicyRule {
                id,
                priority: entry.priority,
                condition,
                when: entry.when,
                action: entry.action,
                severity: entry.severity,
                short_circuit: entry.short_circuit,
                description: entry.description,
            });
        }
        if doc.builtin_rules {
            rules.extend(builtin_rules(doc.unprocessable_action));
        }
        Ok(Self {
            version: doc.version,
            generation: 0,
            fingerprint,
            unprocessable_action: doc.unprocessable_action,
            rules: sorted(rules),
        })
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hex sha256 of the source document.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn unprocessable_action(&self) -> Action {
        self.unprocessable_action
    }

    /// Rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn sorted(mut rules: Vec<PolicyRule>) -> Vec<PolicyRule> {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    rules
}

const DEGRADED_WHEN: &str =
    "(band == ambiguous OR escalated OR rate_limited OR deadline_elapsed) AND NOT verdict_ok";

/// Ambiguous local evidence, or any unit the gate wanted arbitrated (text
/// escalations carry no risk band).
fn wanted_arbitration() -> Condition {
    [Flag::Escalated, Flag::RateLimited, Flag::DeadlineElapsed]
        .into_iter()
        .fold(
            Condition::Band {
                negate: false,
                band: ConfidenceBand::Ambiguous,
            },
            |acc, flag| Condition::Or(Box::new(acc), Box::new(Condition::Flag(flag))),
        )
}

fn builtin_rules(unprocessable_action: Action) -> Vec<PolicyRule> {
    let band = |band| Condition::Band {
        negate: false,
        band,
    };
    let defs = [
        (
            "builtin.high-band",
            "band == high",
            band(ConfidenceBand::High),
            Action::Block,
            100,
            "local evidence above the high-trust bound",
        ),
        (
            "builtin.degraded-ambiguous",
            DEGRADED_WHEN,
            Condition::And(
                Box::new(wanted_arbitration()),
                Box::new(Condition::Not(Box::new(Condition::Flag(Flag::VerdictOk)))),
            ),
            Action::Warn,
            60,
            "arbitration was warranted but no usable remote verdict arrived",
        ),
        (
            "builtin.unprocessable",
            "unprocessable",
            Condition::Flag(Flag::Unprocessable),
            unprocessable_action,
            100,
            "detector input could not be processed",
        ),
    ];
    defs.into_iter()
        .map(|(id, when, condition, action, severity, description)| PolicyRule {
            id: id.to_string(),
            priority: BUILTIN_PRIORITY,
            condition,
            when: when.to_string(),
            action,
            severity,
            short_circuit: false,
            description: Some(description.to_string()),
        })
        .collect()
}

/// Hex sha256 of `bytes`.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
version = "v7"

[[rules]]
id = "weapon-confirmed"
priority = 1
when = '"weapon" in categories AND confidence > 0.7'
action = "block"
severity = 90
short_circuit = true

[[rules]]
id = "contact-spam"
priority = 5
when = 'text matches "(?i)wechat|telegram"'
action = "WARN"
severity = 40
description = "off-platform solicitation"

[[rules]]
id = "a-low"
priority = 5
when = "band == low"
action = "allow"
"#;

    #[test]
    fn toml_document_compiles_in_priority_then_id_order() {
        let set = RuleSet::parse(DOC, RuleFormat::Toml).unwrap();
        let ids: Vec<_> = set.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            [
                "weapon-confirmed",
                "a-low",
                "contact-spam",
                "builtin.degraded-ambiguous",
                "builtin.high-band",
                "builtin.unprocessable",
            ]
        );
        assert_eq!(set.version(), "v7");
        assert_eq!(set.fingerprint().len(), 64);
        assert_eq!(set.rules()[2].action, Action::Warn);
    }

    #[test]
    fn json_documents_are_accepted() {
        let raw = r#"{"version":"j1","builtin_rules":false,"rules":[
            {"id":"r1","priority":2,"when":"band == high","action":"block","severity":100}
        ]}"#;
        let set = RuleSet::parse(raw, RuleFormat::Json).unwrap();
        assert_eq!(set.len(), 1);
        assert!(!set.rules()[0].is_builtin());
    }

    #[test]
    fn builtins_can_be_disabled_and_unprocessable_action_overridden() {
        let raw = "builtin_rules = false\n";
        assert!(RuleSet::parse(raw, RuleFormat::Toml).unwrap().is_empty());

        let raw = "unprocessable_action = \"warn\"\n";
        let set = RuleSet::parse(raw, RuleFormat::Toml).unwrap();
        let rule = set.rules().iter().find(|r| r.id == "builtin.unprocessable").unwrap();
        assert_eq!(rule.action, Action::Warn);
        assert_eq!(set.unprocessable_action(), Action::Warn);
    }

    #[test]
    fn validation_rejects_bad_documents() {
        let cases = [
            ("[[rules]]\nid = \"\"\nwhen = \"true\"\naction = \"allow\"\n", "empty id"),
            (
                "[[rules]]\nid = \"builtin.mine\"\nwhen = \"true\"\naction = \"allow\"\n",
                "reserved",
            ),
            (
                "[[rules]]\nid = \"x\"\nwhen = \"true\"\naction = \"allow\"\n[[rules]]\nid = \"x\"\nwhen = \"true\"\naction = \"warn\"\n",
                "duplicate",
            ),
            (
                "[[rules]]\nid = \"x\"\nwhen = \"true\"\naction = \"allow\"\nseverity = 101\n",
                "severity",
            ),
            (
                "[[rules]]\nid = \"x\"\nwhen = \"confidence >\"\naction = \"allow\"\n",
                "CFN-2002",
            ),
            ("[[rules]]\nid = \"x\"\nwhen = \"true\"\naction = \"explode\"\n", "toml"),
            ("surprise = 1\n", "toml"),
        ];
        for (raw, needle) in cases {
            let err = RuleSet::parse(raw, RuleFormat::Toml).unwrap_err();
            assert!(err.to_string().contains(needle), "{needle}: {err}");
        }
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(RuleFormat::from_path(Path::new("r.TOML")).unwrap(), RuleFormat::Toml);
        assert_eq!(RuleFormat::from_path(Path::new("r.json")).unwrap(), RuleFormat::Json);
        assert_eq!(
            RuleFormat::from_path(Path::new("r.yaml")).unwrap_err().code(),
            "CFN-2003"
        );
    }

    #[test]
    fn builtin_only_has_three_rules() {
        let set = RuleSet::builtin_only();
        assert_eq!(set.len(), 3);
        assert!(set.rules().iter().all(PolicyRule::is_builtin));
        assert_eq!(set.version(), BUILTIN_VERSION);
    }

    #[test]
    fn builtin_trees_match_their_source_text() {
        use crate::core::evidence::{
            DetectionSet, EscalationReason, EvidenceSnapshot, GateOutcome, SkipReason, Verdict,
            VerdictStatus,
        };
        use std::sync::Arc;

        let set = RuleSet::builtin_only();
        let gates = [
            GateOutcome::Skip(SkipReason::LocalOnly),
            GateOutcome::Skip(SkipReason::RateLimited),
            GateOutcome::Skip(SkipReason::DeadlineElapsed),
            GateOutcome::Escalate(EscalationReason::TextPresent { text_candidates: 1 }),
        ];
        let verdicts = [
            None,
            Some(Verdict::failed(VerdictStatus::Timeout, "slow", 5, 2)),
            Some(Verdict::success(Vec::new(), "fine", 5, 1)),
        ];
        for band in [
            ConfidenceBand::None,
            ConfidenceBand::Low,
            ConfidenceBand::Ambiguous,
            ConfidenceBand::High,
        ] {
            for unprocessable in [false, true] {
                for gate in &gates {
                    for verdict in &verdicts {
                        let detections = if unprocessable {
                            DetectionSet::unprocessable("u", None, "bad")
                        } else {
                            DetectionSet::new("u", None, Vec::new())
                        };
                        let ev = EvidenceSnapshot::new(
                            Arc::new(detections),
                            verdict.clone().map(Arc::new),
                            band,
                            gate.clone(),
                        );
                        for rule in set.rules() {
                            let reparsed = Condition::parse(&rule.when).unwrap();
                            assert_eq!(
                                rule.condition.holds(&ev),
                                reparsed.holds(&ev),
                                "{} {gate:?}",
                                rule.id
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn degraded_builtin_covers_unbanded_escalations() {
        use crate::core::evidence::{
            DetectionSet, EscalationReason, EvidenceSnapshot, GateOutcome, SkipReason, Verdict,
            VerdictStatus,
        };
        use std::sync::Arc;

        let set = RuleSet::builtin_only();
        let degraded = set
            .rules()
            .iter()
            .find(|r| r.id == "builtin.degraded-ambiguous")
            .unwrap();
        let text = GateOutcome::Escalate(EscalationReason::TextPresent { text_candidates: 1 });
        let cases = [
            (text.clone(), Some(Verdict::failed(VerdictStatus::Timeout, "slow", 5, 3)), true),
            (text.clone(), Some(Verdict::failed(VerdictStatus::CircuitOpen, "open", 0, 0)), true),
            (text, Some(Verdict::success(Vec::new(), "fine", 5, 1)), false),
            (GateOutcome::Skip(SkipReason::RateLimited), None, true),
            (
                GateOutcome::Skip(SkipReason::DeadlineElapsed),
                Some(Verdict::failed(VerdictStatus::Timeout, "late", 0, 0)),
                true,
            ),
            (GateOutcome::Skip(SkipReason::LocalOnly), None, false),
        ];
        for (gate, verdict, expected) in cases {
            let ev = EvidenceSnapshot::new(
                Arc::new(DetectionSet::new("u", None, Vec::new())),
                verdict.map(Arc::new),
                ConfidenceBand::None,
                gate.clone(),
            );
            assert_eq!(degraded.condition.holds(&ev), expected, "{gate:?}");
        }
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
