//! SQLite mirror of the audit log, indexed by unit id for operator queries.
//! The JSONL file stays authoritative; this is a convenience index.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, params};

use super::jsonl::AuditRecord;
use crate::core::errors::{CfnError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS decisions (
    seq               INTEGER PRIMARY KEY,
    unit_id           TEXT NOT NULL,
    action            TEXT NOT NULL,
    matched_rule_id   TEXT NOT NULL,
    severity          INTEGER NOT NULL,
    tier              TEXT NOT NULL,
    policy_version    TEXT NOT NULL,
    policy_generation INTEGER NOT NULL,
    decided_at        TEXT,
    hash              TEXT NOT NULL,
    record_json       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decisions_unit ON decisions(unit_id);
";

/// A row as operators query it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRow {
    pub seq: u64,
    pub unit_id: String,
    pub action: String,
    pub matched_rule_id: String,
    pub severity: u8,
}

/// WAL-mode SQLite mirror.
#[derive(Debug)]
pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

impl SqliteMirror {
    /// Open or create the mirror database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CfnError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            log::debug!("audit mirror {} running in {mode} journal mode", path.display());
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert one record. Re-inserting the same `seq` replaces it, so replays
    /// after a partial failure are harmless.
    pub fn insert(&self, record: &AuditRecord) -> Result<()> {
        let d = &record.decision;
        let json = serde_json::to_string(record)?;
        let seq = i64::try_from(record.seq).map_err(|_| CfnError::Sql {
            context: "insert",
            details: format!("sequence {} out of range", record.seq),
        })?;
        let generation = i64::try_from(d.policy_generation).unwrap_or(i64::MAX);
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO decisions
             (seq, unit_id, action, matched_rule_id, severity, tier, policy_version,
              policy_generation, decided_at, hash, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                seq,
                d.unit_id,
                d.action.to_string(),
                d.matched_rule_id,
                d.severity,
                serde_json::to_string(&d.tier)?.trim_matches('"'),
                d.policy_version,
                generation,
                d.decided_at.map(|t| t.to_rfc3339()),
                record.hash,
                json,
            ],
        )?;
        Ok(())
    }

    /// Every decision recorded for `unit_id`, oldest first.
    pub fn by_unit(&self, unit_id: &str) -> Result<Vec<MirrorRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, unit_id, action, matched_rule_id, severity
             FROM decisions WHERE unit_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![unit_id], |row| {
                Ok(MirrorRow {
                    seq: row.get::<_, i64>(0)?.unsigned_abs(),
                    unit_id: row.get(1)?,
                    action: row.get(2)?,
                    matched_rule_id: row.get(3)?,
                    severity: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Total rows.
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get(0))?;
        Ok(n.unsigned_abs())
    }
}
