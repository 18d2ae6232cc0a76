//! The audit trail: JSONL first, SQLite mirror second.
//!
//! The JSONL append decides success. Mirror failures are counted and logged
//! once per outage but never fail an append; the mirror catches up on later
//! records and `INSERT OR REPLACE` keeps replays harmless.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::jsonl::{AuditRecord, AuditWriter, JsonlAuditLog};
#[cfg(feature = "sqlite")]
use super::sqlite::SqliteMirror;
use crate::core::config::AuditConfig;
use crate::core::errors::Result;
use crate::core::evidence::Decision;
use crate::monitor::telemetry::{Counter, FunnelCounters, TelemetrySample};

/// JSONL audit log plus optional mirror.
#[derive(Debug)]
pub struct AuditTrail {
    jsonl: JsonlAuditLog,
    #[cfg(feature = "sqlite")]
    mirror: Option<SqliteMirror>,
    #[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
    mirror_healthy: AtomicBool,
    #[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
    counters: Arc<FunnelCounters>,
}

impl AuditTrail {
    /// Open the trail described by `config`. A mirror that cannot be opened
    /// is logged and skipped; the JSONL log must open.
    pub fn open(config: &AuditConfig, counters: Arc<FunnelCounters>) -> Result<Self> {
        let jsonl = JsonlAuditLog::open(&config.path, config.fsync)?;

        #[cfg(feature = "sqlite")]
        let mirror = config.sqlite_path.as_deref().and_then(|path| {
            match SqliteMirror::open(path) {
                Ok(m) => Some(m),
                Err(e) => {
                    counters.incr(Counter::MirrorFailures);
                    log::warn!("audit mirror {} unavailable, JSONL only: {e}", path.display());
                    None
                }
            }
        });
        #[cfg(not(feature = "sqlite"))]
        if let Some(path) = &config.sqlite_path {
            log::warn!(
                "audit.sqlite_path = {} ignored: built without the sqlite feature",
                path.display()
            );
        }

        Ok(Self {
            jsonl,
            #[cfg(feature = "sqlite")]
            mirror,
            mirror_healthy: AtomicBool::new(true),
            counters,
        })
    }

    /// The authoritative JSONL log.
    #[must_use]
    pub fn jsonl(&self) -> &JsonlAuditLog {
        &self.jsonl
    }

    /// The mirror, when configured and open.
    #[cfg(feature = "sqlite")]
    #[must_use]
    pub fn mirror(&self) -> Option<&SqliteMirror> {
        self.mirror.as_ref()
    }

    #[cfg(feature = "sqlite")]
    fn mirror_record(&self, record: &AuditRecord) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        match mirror.insert(record) {
            Ok(()) => {
                if !self.mirror_healthy.swap(true, Ordering::SeqCst) {
                    log::info!("audit mirror recovered at seq {}", record.seq);
                }
            }
            Err(e) => {
                self.counters.event(
                    Counter::MirrorFailures,
                    TelemetrySample::new("audit", "mirror_failure", e.to_string()),
                );
                if self.mirror_healthy.swap(false, Ordering::SeqCst) {
                    log::warn!("audit mirror write failed, continuing JSONL only: {e}");
                }
            }
        }
    }

    #[cfg(not(feature = "sqlite"))]
    fn mirror_record(&self, _record: &AuditRecord) {}
}

impl AuditWriter for AuditTrail {
    fn append(&self, decision: &Decision) -> Result<AuditRecord> {
        let record = self.jsonl.append(decision)?;
        self.mirror_record(&record);
        Ok(record)
    }
}
