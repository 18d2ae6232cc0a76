//! The funnel: Collector → Gate → [Arbitration] → Policy → Aggregator.
//!
//! [`Funnel`] runs one unit end to end on the calling thread; [`workers`]
//! fans independent units out over a bounded queue. Every unit that enters
//! yields exactly one decision or one audited error.

pub mod workers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aggregator::{Aggregator, DecisionSink};
use crate::arbitration::{ArbitrationClient, CircuitBreaker, RemoteArbiter};
use crate::collector::{Collector, RawUnit};
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::core::evidence::{
    Decision, DetectionSet, EscalationRequest, EvidenceSnapshot, GateOutcome, SkipReason, Verdict,
    VerdictStatus,
};
use crate::gate::EscalationGate;
use crate::logger::dual::AuditTrail;
use crate::logger::jsonl::AuditWriter;
use crate::monitor::telemetry::FunnelCounters;
use crate::policy::{PolicyEngine, RuleStore};

pub use workers::{FunnelWorkers, Job, WorkerReport};

/// Every stage of the decision core, wired together.
pub struct Funnel {
    collector: Collector,
    gate: EscalationGate,
    arbiter: Option<ArbitrationClient>,
    policy: PolicyEngine,
    aggregator: Aggregator,
    unit_deadline: Duration,
    counters: Arc<FunnelCounters>,
}

impl std::fmt::Debug for Funnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Funnel")
            .field("arbitration", &self.arbiter.is_some())
            .field("unit_deadline", &self.unit_deadline)
            .finish_non_exhaustive()
    }
}

impl Funnel {
    /// Build the production funnel: HTTP arbiter when an endpoint is
    /// configured, rules from `policy.rules_path` (or built-ins), and the
    /// configured audit trail.
    pub fn from_config(config: &Config, sink: Arc<dyn DecisionSink>) -> Result<Self> {
        let counters = FunnelCounters::shared();
        let store = match &config.policy.rules_path {
            Some(path) => RuleStore::from_path(path, Arc::clone(&counters))?,
            None => RuleStore::builtin(Arc::clone(&counters)),
        };
        let audit = AuditTrail::open(&config.audit, Arc::clone(&counters))?;
        Self::from_parts(
            config,
            remote_from_config(config)?,
            Arc::new(store),
            Arc::new(audit),
            sink,
            counters,
        )
    }

    /// Assemble from injected collaborators.
    pub fn from_parts(
        config: &Config,
        remote: Option<Arc<dyn RemoteArbiter>>,
        store: Arc<RuleStore>,
        audit: Arc<dyn AuditWriter>,
        sink: Arc<dyn DecisionSink>,
        counters: Arc<FunnelCounters>,
    ) -> Result<Self> {
        let arbiter = match remote {
            Some(remote) => {
                let breaker = Arc::new(CircuitBreaker::new(&config.breaker, Arc::clone(&counters)));
                Some(ArbitrationClient::new(
                    &config.arbitration,
                    breaker,
                    remote,
                    Arc::clone(&counters),
                )?)
            }
            None => {
                log::info!("no arbitration endpoint configured; ambiguous units are decided locally");
                None
            }
        };
        Ok(Self {
            collector: Collector::from_config(&config.collector, Arc::clone(&counters)),
            gate: EscalationGate::from_config(&config.gate, Arc::clone(&counters)),
            arbiter,
            policy: PolicyEngine::new(store),
            aggregator: Aggregator::new(audit, sink, &config.audit, Arc::clone(&counters)),
            unit_deadline: config.pipeline.unit_deadline(),
            counters,
        })
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<FunnelCounters> {
        &self.counters
    }

    #[must_use]
    pub fn rules(&self) -> &Arc<RuleStore> {
        self.policy.store()
    }

    #[must_use]
    pub fn arbitration(&self) -> Option<&ArbitrationClient> {
        self.arbiter.as_ref()
    }

    /// Gate, arbitrate if warranted, and evaluate policy. Nothing is
    /// audited; the decision is not yet finalized.
    pub fn decide(&self, set: DetectionSet, deadline: Instant) -> Decision {
        let set = Arc::new(set);
        let assessment = self.gate.decide_until(&set, deadline);
        let (gate, verdict) = match assessment.outcome {
            skip @ GateOutcome::Skip(SkipReason::DeadlineElapsed) => {
                let verdict = Verdict::failed(
                    VerdictStatus::Timeout,
                    "unit deadline elapsed before arbitration",
                    0,
                    0,
                );
                (skip, Some(verdict))
            }
            GateOutcome::Escalate(reason) => {
                if let Some(client) = &self.arbiter {
                    let request = EscalationRequest::new(Arc::clone(&set), reason.clone(), deadline);
                    (GateOutcome::Escalate(reason), Some(client.arbitrate(request)))
                } else {
                    let verdict =
                        Verdict::failed(VerdictStatus::Error, "arbitration disabled", 0, 0);
                    (GateOutcome::Escalate(reason), Some(verdict))
                }
            }
            skip @ GateOutcome::Skip(_) => (skip, None),
        };
        let evidence = EvidenceSnapshot::new(set, verdict.map(Arc::new), assessment.band, gate);
        self.policy.decide(evidence)
    }

    /// Run one raw unit through every stage; the deadline starts now.
    pub fn process(&self, raw: RawUnit) -> Result<Decision> {
        self.process_received(raw, Instant::now())
    }

    /// Run one raw unit whose deadline started at `received`.
    pub fn process_received(&self, raw: RawUnit, received: Instant) -> Result<Decision> {
        let set = self.collector.collect(raw);
        self.finish(set, received)
    }

    /// Parse and run one JSON line. Malformed input still yields a decision.
    pub fn process_json(&self, line: &str, fallback_id: &str) -> Result<Decision> {
        self.process_json_received(line, fallback_id, Instant::now())
    }

    /// [`Self::process_json`] with an explicit arrival time.
    pub fn process_json_received(
        &self,
        line: &str,
        fallback_id: &str,
        received: Instant,
    ) -> Result<Decision> {
        let set = self.collector.collect_json(line, fallback_id);
        self.finish(set, received)
    }

    fn finish(&self, set: DetectionSet, received: Instant) -> Result<Decision> {
        let decision = self.decide(set, received + self.unit_deadline);
        self.aggregator.commit(decision)
    }
}

#[cfg(feature = "http")]
fn remote_from_config(config: &Config) -> Result<Option<Arc<dyn RemoteArbiter>>> {
    use crate::arbitration::http::HttpArbiter;

    Ok(HttpArbiter::from_config(&config.arbitration)?
        .map(|http| Arc::new(http) as Arc<dyn RemoteArbiter>))
}

#[cfg(not(feature = "http"))]
fn remote_from_config(config: &Config) -> Result<Option<Arc<dyn RemoteArbiter>>> {
    if let Some(endpoint) = &config.arbitration.endpoint {
        log::warn!("arbitration endpoint {endpoint} ignored: built without the http feature");
    }
    Ok(None)
}
