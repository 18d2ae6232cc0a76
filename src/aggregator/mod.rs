//! Decision aggregator: finalize, durably audit, then emit.
//!
//! The audit append comes first and is fatal for the unit's acknowledgement:
//! a decision that cannot be recorded is never emitted. Emission is
//! at-least-once; consumers dedupe by unit id.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::core::config::AuditConfig;
use crate::core::errors::{CfnError, Result};
use crate::core::evidence::{Action, Decision};
use crate::logger::jsonl::AuditWriter;
use crate::monitor::telemetry::{Counter, FunnelCounters, TelemetrySample};
use crate::policy::rules::BUILTIN_VERSION;

const RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Where finalized decisions go.
pub trait DecisionSink: Send + Sync {
    /// Deliver one decision. May be called more than once for the same unit.
    fn emit(&self, decision: &Decision) -> Result<()>;
}

/// Writes each decision as one JSON line and flushes.
pub struct JsonlSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Give back the writer (tests read what was emitted).
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> std::fmt::Debug for JsonlSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlSink").finish_non_exhaustive()
    }
}

impl<W: Write + Send> DecisionSink for JsonlSink<W> {
    fn emit(&self, decision: &Decision) -> Result<()> {
        let mut line = serde_json::to_string(decision)?;
        line.push('\n');
        let mut out = self.out.lock();
        out.write_all(line.as_bytes())
            .and_then(|()| out.flush())
            .map_err(|e| CfnError::io("<decision sink>", e))
    }
}

/// Hands decisions to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Decision>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: Sender<Decision>) -> Self {
        Self { tx }
    }
}

impl DecisionSink for ChannelSink {
    fn emit(&self, decision: &Decision) -> Result<()> {
        self.tx
            .send(decision.clone())
            .map_err(|_| CfnError::ChannelClosed {
                component: "decision sink",
            })
    }
}

/// Final stage of the funnel.
pub struct Aggregator {
    audit: Arc<dyn AuditWriter>,
    sink: Arc<dyn DecisionSink>,
    audit_retries: u32,
    emit_retries: u32,
    counters: Arc<FunnelCounters>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("audit_retries", &self.audit_retries)
            .field("emit_retries", &self.emit_retries)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    #[must_use]
    pub fn new(
        audit: Arc<dyn AuditWriter>,
        sink: Arc<dyn DecisionSink>,
        config: &AuditConfig,
        counters: Arc<FunnelCounters>,
    ) -> Self {
        Self {
            audit,
            sink,
            audit_retries: config.audit_retries,
            emit_retries: config.emit_retries,
            counters,
        }
    }

    /// Stamp the decision time and fill a missing policy version. Fields
    /// already set are left alone.
    #[must_use]
    pub fn finalize(mut decision: Decision) -> Decision {
        if decision.decided_at.is_none() {
            decision.decided_at = Some(chrono::Utc::now());
        }
        if decision.policy_version.is_empty() {
            decision.policy_version = BUILTIN_VERSION.to_string();
        }
        decision
    }

    /// Durably record `decision`, retrying up to `audit_retries` times.
    /// Errors that are not [`CfnError::is_retryable`] end the loop early.
    pub fn append(&self, decision: &Decision) -> Result<()> {
        let budget = self.audit_retries + 1;
        let mut attempts = 0;
        let mut last_err = None;
        while attempts < budget {
            attempts += 1;
            match self.audit.append(decision) {
                Ok(record) => {
                    log::trace!("unit {} audited as seq {}", decision.unit_id, record.seq);
                    return Ok(());
                }
                Err(e) => {
                    log::debug!(
                        "unit {}: audit append attempt {attempts}/{budget} failed: {e}",
                        decision.unit_id
                    );
                    let retryable = e.is_retryable();
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempts < budget {
                        thread::sleep(RETRY_PAUSE);
                    }
                }
            }
        }
        let details = last_err.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        self.counters.event(
            Counter::AuditFailures,
            TelemetrySample::new("aggregator", "audit_failure", format!("{}: {details}", decision.unit_id)),
        );
        log::error!(
            "OPERATOR ALERT: unit {} ({}) could not be audited after {attempts} attempts: {details}",
            decision.unit_id,
            decision.action
        );
        Err(CfnError::AuditAppend { attempts, details })
    }

    /// Deliver to the sink, retrying up to `emit_retries` times.
    pub fn emit(&self, decision: &Decision) -> Result<()> {
        let budget = self.emit_retries + 1;
        let mut attempts = 0;
        let mut last_err = None;
        while attempts < budget {
            attempts += 1;
            match self.sink.emit(decision) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!(
                        "unit {}: emit attempt {attempts}/{budget} failed: {e}",
                        decision.unit_id
                    );
                    let retryable = e.is_retryable();
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempts < budget {
                        thread::sleep(RETRY_PAUSE);
                    }
                }
            }
        }
        let details = last_err.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        log::error!(
            "unit {}: decision audited but not delivered after {attempts} attempts: {details}",
            decision.unit_id
        );
        Err(CfnError::SinkEmit { attempts, details })
    }

    /// Finalize, audit, emit. Returns the finalized decision once audited
    /// and delivered.
    pub fn commit(&self, decision: Decision) -> Result<Decision> {
        let decision = Self::finalize(decision);
        self.append(&decision)?;
        self.emit(&decision)?;
        self.counters.incr(match decision.action {
            Action::Allow => Counter::DecisionsAllow,
            Action::Warn => Counter::DecisionsWarn,
            Action::Block => Counter::DecisionsBlock,
        });
        log::info!(
            "unit {} -> {} by {} (severity {}, generation {})",
            decision.unit_id,
            decision.action,
            decision.matched_rule_id,
            decision.severity,
            decision.policy_generation
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::jsonl::tests::decision;
    use crate::logger::jsonl::{AuditRecord, JsonlAuditLog, verify_chain};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct BrokenAudit {
        calls: AtomicU32,
    }

    impl AuditWriter for BrokenAudit {
        fn append(&self, _decision: &Decision) -> Result<AuditRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CfnError::io("/full/disk", std::io::Error::other("no space left")))
        }
    }

    /// Rejects every decision with an error no retry can fix.
    struct UnserializableAudit {
        calls: AtomicU32,
    }

    impl AuditWriter for UnserializableAudit {
        fn append(&self, _decision: &Decision) -> Result<AuditRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CfnError::Serialization {
                context: "audit record",
                details: "float is not finite".to_string(),
            })
        }
    }

    /// Fails the first `failures` emits, then records.
    struct FlakySink {
        failures: AtomicU32,
        delivered: Mutex<Vec<String>>,
    }

    impl FlakySink {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    impl DecisionSink for FlakySink {
        fn emit(&self, decision: &Decision) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(CfnError::ChannelClosed { component: "test" });
            }
            self.delivered.lock().push(decision.unit_id.clone());
            Ok(())
        }
    }

    fn config(retries: u32) -> AuditConfig {
        AuditConfig {
            audit_retries: retries,
            emit_retries: retries,
            fsync: false,
            ..AuditConfig::default()
        }
    }

    #[test]
    fn finalize_keeps_existing_fields() {
        let mut d = decision("u1", Action::Block);
        d.decided_at = None;
        d.policy_version = String::new();
        let d = Aggregator::finalize(d);
        assert!(d.is_finalized());
        assert_eq!(d.policy_version, BUILTIN_VERSION);

        let stamped = decision("u2", Action::Warn);
        let at = stamped.decided_at;
        assert_eq!(Aggregator::finalize(stamped).decided_at, at);
    }

    #[test]
    fn commit_audits_then_emits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let audit = Arc::new(JsonlAuditLog::open(&path, false).unwrap());
        let sink = FlakySink::new(0);
        let counters = FunnelCounters::shared();
        let agg = Aggregator::new(audit, sink.clone(), &config(0), Arc::clone(&counters));

        let mut d = decision("u1", Action::Block);
        d.decided_at = None;
        let out = agg.commit(d).unwrap();
        assert!(out.decided_at.is_some());
        assert_eq!(*sink.delivered.lock(), ["u1"]);
        assert_eq!(verify_chain(&path).unwrap().records, 1);
        assert_eq!(counters.get(Counter::DecisionsBlock), 1);
    }

    #[test]
    fn audit_failure_is_fatal_and_never_emitted() {
        let audit = Arc::new(BrokenAudit {
            calls: AtomicU32::new(0),
        });
        let sink = FlakySink::new(0);
        let counters = FunnelCounters::shared();
        let agg = Aggregator::new(audit.clone(), sink.clone(), &config(2), Arc::clone(&counters));

        let err = agg.commit(decision("u1", Action::Warn)).unwrap_err();
        assert_eq!(err.code(), "CFN-3001");
        assert_eq!(audit.calls.load(Ordering::SeqCst), 3);
        assert!(sink.delivered.lock().is_empty());
        assert_eq!(counters.get(Counter::AuditFailures), 1);
        assert_eq!(counters.get(Counter::DecisionsWarn), 0);
    }

    #[test]
    fn permanent_audit_errors_are_not_retried() {
        let audit = Arc::new(UnserializableAudit {
            calls: AtomicU32::new(0),
        });
        let sink = FlakySink::new(0);
        let agg = Aggregator::new(audit.clone(), sink.clone(), &config(5), FunnelCounters::shared());

        let err = agg.commit(decision("u1", Action::Block)).unwrap_err();
        assert!(matches!(err, CfnError::AuditAppend { attempts: 1, .. }), "{err}");
        assert_eq!(audit.calls.load(Ordering::SeqCst), 1);
        assert!(sink.delivered.lock().is_empty());
    }

    #[test]
    fn transient_sink_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(JsonlAuditLog::open(&dir.path().join("a.jsonl"), false).unwrap());
        let sink = FlakySink::new(2);
        let agg = Aggregator::new(audit, sink.clone(), &config(2), FunnelCounters::shared());
        agg.commit(decision("u1", Action::Allow)).unwrap();
        assert_eq!(*sink.delivered.lock(), ["u1"]);
    }

    #[test]
    fn persistent_sink_failure_surfaces_after_audit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        let audit = Arc::new(JsonlAuditLog::open(&path, false).unwrap());
        let agg = Aggregator::new(audit, FlakySink::new(10), &config(1), FunnelCounters::shared());
        let err = agg.commit(decision("u1", Action::Allow)).unwrap_err();
        assert_eq!(err.code(), "CFN-3005");
        assert_eq!(verify_chain(&path).unwrap().records, 1);
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_decision() {
        let sink = JsonlSink::new(Vec::new());
        sink.emit(&decision("u1", Action::Block)).unwrap();
        sink.emit(&decision("u2", Action::Allow)).unwrap();
        let raw = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: Decision = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back.unit_id, "u2");
    }

    #[test]
    fn closed_channel_is_reported() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = ChannelSink::new(tx);
        sink.emit(&decision("u1", Action::Warn)).unwrap();
        assert_eq!(rx.recv().unwrap().unit_id, "u1");
        drop(rx);
        assert_eq!(sink.emit(&decision("u2", Action::Warn)).unwrap_err().code(), "CFN-3003");
    }
}
