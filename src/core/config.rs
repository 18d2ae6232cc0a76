//! Runtime configuration: TOML file, `CFN_*` env overrides, validation.
//!
//! Every section is `#[serde(default)]` so a partial file only overrides what
//! it names. Durations are stored as integer milliseconds/seconds to keep the
//! on-disk format flat.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CfnError, Result};

/// Default risk labels: the objects the local detector watches for.
pub const DEFAULT_RISK_LABELS: &[&str] = &[
    "weapon",
    "gun",
    "knife",
    "scissors",
    "baseball bat",
    "fire",
];

/// Full runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collector: CollectorConfig,
    pub gate: GateConfig,
    pub arbitration: ArbitrationConfig,
    pub breaker: BreakerConfig,
    pub policy: PolicyConfig,
    pub audit: AuditConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Candidates below this confidence are dropped (recall floor).
    pub min_confidence: f64,
    /// Candidates kept per unit, in input order.
    pub max_candidates: usize,
    /// Label rewrites applied after lowercasing, e.g. `firearm = "gun"`.
    pub label_aliases: BTreeMap<String, String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.15,
            max_candidates: 256,
            label_aliases: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Below this a candidate is decided locally.
    pub low_trust: f64,
    /// Above this a candidate is blocked without escalation.
    pub high_trust: f64,
    /// Labels that participate in banding. Empty means every label.
    pub risk_labels: Vec<String>,
    /// Escalate units carrying recognized text at or above `low_trust`.
    pub escalate_on_text: bool,
    /// Token-bucket refill rate (escalations per second).
    pub rate_per_sec: f64,
    /// Token-bucket capacity.
    pub burst: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            low_trust: 0.3,
            high_trust: 0.9,
            risk_labels: DEFAULT_RISK_LABELS.iter().map(|s| (*s).to_string()).collect(),
            escalate_on_text: false,
            rate_per_sec: 5.0,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// Remote endpoint for the HTTP transport. `None` disables arbitration.
    pub endpoint: Option<String>,
    /// Name of the env var holding the bearer token.
    pub api_key_env: String,
    pub attempt_timeout_ms: u64,
    /// Overall per-request budget, further capped by the unit deadline.
    pub request_deadline_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Jitter as a fraction of the computed backoff (0.0..=1.0).
    pub jitter: f64,
    /// Ceiling on concurrent remote calls.
    pub max_in_flight: usize,
    /// How long a caller waits for a free slot before being rejected.
    pub acquire_wait_ms: u64,
    /// Upstream summary is truncated to this many characters.
    pub summary_max_chars: usize,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "CFN_ARBITER_API_KEY".to_string(),
            attempt_timeout_ms: 800,
            request_deadline_ms: 2_500,
            max_retries: 2,
            backoff_base_ms: 50,
            backoff_max_ms: 400,
            jitter: 0.2,
            max_in_flight: 8,
            acquire_wait_ms: 50,
            summary_max_chars: 500,
        }
    }
}

impl ArbitrationConfig {
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    #[must_use]
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    #[must_use]
    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Rolling window over which outcomes are counted.
    pub window_secs: u64,
    /// Minimum outcomes in the window before the breaker may open.
    pub min_calls: u32,
    /// Failure ratio at or above which the breaker opens.
    pub failure_rate: f64,
    /// Time spent open before a single half-open probe is admitted.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_secs: 30,
            min_calls: 5,
            failure_rate: 0.5,
            cooldown_secs: 15,
        }
    }
}

impl BreakerConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Rule document (`.toml` or `.json`). `None` runs on built-in rules only.
    pub rules_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append-only JSONL audit trail.
    pub path: PathBuf,
    /// Optional SQLite mirror (feature `sqlite`).
    pub sqlite_path: Option<PathBuf>,
    /// `sync_data` after every append.
    pub fsync: bool,
    pub audit_retries: u32,
    pub emit_retries: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cfn-audit.jsonl"),
            sqlite_path: None,
            fsync: true,
            audit_retries: 2,
            emit_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_depth: usize,
    /// Overall budget for one unit, from collection to decision.
    pub unit_deadline_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            unit_deadline_ms: 3_000,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn unit_deadline(&self) -> Duration {
        Duration::from_millis(self.unit_deadline_ms)
    }
}

impl Config {
    /// Read, parse, and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CfnError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|e| CfnError::io(path, e))?;
        let config = Self::from_toml_str(&raw)?;
        Ok(config)
    }

    /// Load from a path when given, otherwise defaults. Env overrides apply
    /// in both cases.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CFN_*` overrides through `lookup` (usually `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CFN_RULES_PATH") {
            self.policy.rules_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CFN_AUDIT_PATH") {
            self.audit.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CFN_ARBITER_ENDPOINT") {
            self.arbitration.endpoint = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("CFN_WORKERS") {
            self.pipeline.workers = parse_override("CFN_WORKERS", &v)?;
        }
        if let Some(v) = lookup("CFN_RATE_PER_SEC") {
            self.gate.rate_per_sec = parse_override("CFN_RATE_PER_SEC", &v)?;
        }
        Ok(())
    }

    /// Reject configurations the funnel cannot run with.
    pub fn validate(&self) -> Result<()> {
        let gate = &self.gate;
        for (name, value) in [
            ("gate.low_trust", gate.low_trust),
            ("gate.high_trust", gate.high_trust),
            ("collector.min_confidence", self.collector.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.collector.max_candidates == 0 {
            return Err(invalid("collector.max_candidates must be at least 1"));
        }
        if gate.low_trust > gate.high_trust {
            return Err(invalid(format!(
                "gate.low_trust ({}) exceeds gate.high_trust ({})",
                gate.low_trust, gate.high_trust
            )));
        }
        if !(gate.rate_per_sec.is_finite() && gate.rate_per_sec > 0.0) {
            return Err(invalid("gate.rate_per_sec must be positive"));
        }
        if gate.burst == 0 {
            return Err(invalid("gate.burst must be at least 1"));
        }
        let arb = &self.arbitration;
        if arb.max_in_flight == 0 {
            return Err(invalid("arbitration.max_in_flight must be at least 1"));
        }
        if arb.attempt_timeout_ms == 0 || arb.request_deadline_ms == 0 {
            return Err(invalid("arbitration timeouts must be non-zero"));
        }
        if !(0.0..=1.0).contains(&arb.jitter) {
            return Err(invalid("arbitration.jitter must be within [0, 1]"));
        }
        if arb.backoff_base_ms > arb.backoff_max_ms {
            return Err(invalid("arbitration.backoff_base_ms exceeds backoff_max_ms"));
        }
        let breaker = &self.breaker;
        if !(breaker.failure_rate > 0.0 && breaker.failure_rate <= 1.0) {
            return Err(invalid("breaker.failure_rate must be within (0, 1]"));
        }
        if breaker.min_calls == 0 || breaker.window_secs == 0 {
            return Err(invalid("breaker.min_calls and breaker.window_secs must be non-zero"));
        }
        if self.pipeline.workers == 0 || self.pipeline.queue_depth == 0 {
            return Err(invalid("pipeline.workers and pipeline.queue_depth must be non-zero"));
        }
        if self.pipeline.unit_deadline_ms == 0 {
            return Err(invalid("pipeline.unit_deadline_ms must be non-zero"));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CfnError::Serialization {
            context: "toml",
            details: e.to_string(),
        })
    }
}

fn invalid(details: impl Into<String>) -> CfnError {
    CfnError::InvalidConfig {
        details: details.into(),
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(format!("{key}={raw:?} is not a valid value")))
}
