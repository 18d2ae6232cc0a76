//! Append-only, hash-chained JSONL audit log.
//!
//! Each line is one [`AuditRecord`]. `hash = sha256("{seq}:{prev_hash}:{decision_json}")`
//! and `prev_hash` is the previous line's hash (64 zeros for the first), so
//! any edit, reorder or truncation in the middle of the file breaks the chain.
//! Appends are durable before they return when `fsync` is on.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{CfnError, Result};
use crate::core::evidence::Decision;
use crate::policy::rules::fingerprint;

/// `prev_hash` of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One audit line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub prev_hash: String,
    pub hash: String,
    pub decision: Decision,
}

impl AuditRecord {
    fn seal(seq: u64, prev_hash: String, decision: Decision) -> Result<Self> {
        let hash = record_hash(seq, &prev_hash, &decision)?;
        Ok(Self {
            seq,
            prev_hash,
            hash,
            decision,
        })
    }
}

fn record_hash(seq: u64, prev_hash: &str, decision: &Decision) -> Result<String> {
    let body = serde_json::to_string(decision)?;
    Ok(fingerprint(format!("{seq}:{prev_hash}:{body}").as_bytes()))
}

/// Anything that can durably record a decision.
pub trait AuditWriter: Send + Sync {
    /// Persist `decision`; `Ok` means it survives a crash.
    fn append(&self, decision: &Decision) -> Result<AuditRecord>;
}

#[derive(Debug)]
struct Tail {
    file: File,
    seq: u64,
    last_hash: String,
}

/// The JSONL audit file.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    fsync: bool,
    tail: Mutex<Tail>,
}

impl JsonlAuditLog {
    /// Open (creating if needed) and resume the chain from the last record.
    pub fn open(path: &Path, fsync: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CfnError::io(parent, e))?;
        }
        let (seq, last_hash) = match last_record(path)? {
            Some(rec) => (rec.seq, rec.hash),
            None => (0, GENESIS_HASH.to_string()),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CfnError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            fsync,
            tail: Mutex::new(Tail {
                file,
                seq,
                last_hash,
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number of the last durable record (0 when empty).
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.tail.lock().seq
    }
}

impl AuditWriter for JsonlAuditLog {
    fn append(&self, decision: &Decision) -> Result<AuditRecord> {
        let mut tail = self.tail.lock();
        let record = AuditRecord::seal(tail.seq + 1, tail.last_hash.clone(), decision.clone())?;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let io = |e| CfnError::io(&self.path, e);
        let start_len = tail.file.metadata().map_err(io)?.len();
        let written = tail
            .file
            .write_all(line.as_bytes())
            .and_then(|()| if self.fsync { tail.file.sync_data() } else { Ok(()) });
        if let Err(e) = written {
            // Never leave a torn line behind for the next append to chain onto.
            let _ = tail.file.set_len(start_len);
            return Err(io(e));
        }

        tail.seq = record.seq;
        tail.last_hash.clone_from(&record.hash);
        Ok(record)
    }
}

/// Summary of a verified chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub records: u64,
    pub last_hash: String,
}

/// Re-walk `path` and check every link. Blank lines are ignored.
pub fn verify_chain(path: &Path) -> Result<ChainReport> {
    let file = File::open(path).map_err(|e| CfnError::io(path, e))?;
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut records = 0u64;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| CfnError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditRecord =
            serde_json::from_str(&line).map_err(|e| CfnError::AuditChain {
                line: line_no,
                details: format!("unparseable record: {e}"),
            })?;
        let chain_err = |details: String| CfnError::AuditChain {
            line: line_no,
            details,
        };
        if record.seq != records + 1 {
            return Err(chain_err(format!(
                "sequence {} where {} was expected",
                record.seq,
                records + 1
            )));
        }
        if record.prev_hash != expected_prev {
            return Err(chain_err("prev_hash does not match previous record".to_string()));
        }
        let recomputed = record_hash(record.seq, &record.prev_hash, &record.decision)?;
        if recomputed != record.hash {
            return Err(chain_err("record hash mismatch (content altered)".to_string()));
        }
        expected_prev = record.hash;
        records += 1;
    }
    Ok(ChainReport {
        records,
        last_hash: expected_prev,
    })
}

/// The last `n` records of `path`, oldest first.
pub fn tail(path: &Path, n: usize) -> Result<Vec<AuditRecord>> {
    let file = File::open(path).map_err(|e| CfnError::io(path, e))?;
    let mut window = VecDeque::with_capacity(n.min(1024));
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| CfnError::io(path, e))?;
        if line.trim().is_empty() || n == 0 {
            continue;
        }
        let record: AuditRecord =
            serde_json::from_str(&line).map_err(|e| CfnError::AuditChain {
                line: idx + 1,
                details: format!("unparseable record: {e}"),
            })?;
        if window.len() == n {
            window.pop_front();
        }
        window.push_back(record);
    }
    Ok(window.into())
}

fn last_record(path: &Path) -> Result<Option<AuditRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CfnError::io(path, e)),
    };
    let mut last = None;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| CfnError::io(path, e))?;
        if !line.trim().is_empty() {
            last = Some((idx + 1, line));
        }
    }
    match last {
        None => Ok(None),
        Some((line_no, raw)) => serde_json::from_str(&raw).map(Some).map_err(|e| {
            CfnError::AuditChain {
                line: line_no,
                details: format!("cannot resume chain from torn tail: {e}"),
            }
        }),
    }
}
