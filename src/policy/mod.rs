//! Policy engine: prioritized rules over merged local and remote evidence,
//! with atomic hot-reload of rule-set generations.

pub mod condition;
pub mod engine;
pub mod rules;
pub mod store;

pub use condition::{Condition, ConditionError};
pub use engine::{PolicyEngine, RuleTrace, evaluate, explain};
pub use rules::{NO_MATCH_RULE_ID, PolicyRule, RuleDocument, RuleFormat, RuleSet, RuleEntry};
pub use store::{ReloadOutcome, RuleStore};
