//! Hot-reloadable rule-set store.
//!
//! The active generation sits behind `RwLock<Arc<RuleSet>>`. Readers clone the
//! `Arc` and release the lock immediately, so an evaluation keeps the
//! generation it started with no matter how many swaps happen meanwhile.
//! Reloads compile the whole document before taking the write lock; a
//! document that fails anywhere leaves the live generation untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::rules::{RuleFormat, RuleSet};
use crate::core::errors::Result;
use crate::monitor::telemetry::{Counter, FunnelCounters, TelemetrySample};

/// Outcome of a successful reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new generation is live.
    Swapped { generation: u64 },
    /// The document is byte-identical to the live one; nothing changed.
    Unchanged { generation: u64 },
}

impl ReloadOutcome {
    #[must_use]
    pub fn generation(self) -> u64 {
        match self {
            Self::Swapped { generation } | Self::Unchanged { generation } => generation,
        }
    }
}

/// Shared store. Inject one `Arc<RuleStore>` into every evaluator.
#[derive(Debug)]
pub struct RuleStore {
    current: RwLock<Arc<RuleSet>>,
    next_generation: AtomicU64,
    source: Option<PathBuf>,
    counters: Arc<FunnelCounters>,
}

impl RuleStore {
    /// Store holding `initial` as generation 1.
    #[must_use]
    pub fn new(initial: RuleSet, source: Option<PathBuf>, counters: Arc<FunnelCounters>) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial.with_generation(1))),
            next_generation: AtomicU64::new(2),
            source,
            counters,
        }
    }

    /// Store running on built-in rules only.
    #[must_use]
    pub fn builtin(counters: Arc<FunnelCounters>) -> Self {
        Self::new(RuleSet::builtin_only(), None, counters)
    }

    /// Store loaded from `path`, which later [`reload`](Self::reload)s re-read.
    pub fn from_path(path: &Path, counters: Arc<FunnelCounters>) -> Result<Self> {
        let set = RuleSet::load(path)?;
        log::info!(
            "loaded rules {} ({} rules) from {}",
            set.version(),
            set.len(),
            path.display()
        );
        Ok(Self::new(set, Some(path.to_path_buf()), counters))
    }

    /// The live generation.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read())
    }

    /// Document path reloads read from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Re-read the source document. Without a source this is a no-op.
    pub fn reload(&self) -> Result<ReloadOutcome> {
        match &self.source {
            Some(path) => self.reload_from_path(path),
            None => Ok(ReloadOutcome::Unchanged {
                generation: self.snapshot().generation(),
            }),
        }
    }

    /// Load `path` and install it if valid.
    pub fn reload_from_path(&self, path: &Path) -> Result<ReloadOutcome> {
        let compiled = RuleSet::load(path);
        self.install(compiled, &path.display().to_string())
    }

    /// Parse `raw` and install it if valid.
    pub fn reload_from_str(&self, raw: &str, format: RuleFormat) -> Result<ReloadOutcome> {
        self.install(RuleSet::parse(raw, format), "inline document")
    }

    fn install(&self, compiled: Result<RuleSet>, origin: &str) -> Result<ReloadOutcome> {
        let set = match compiled {
            Ok(set) => set,
            Err(err) => {
                let live = self.snapshot();
                self.counters.event(
                    Counter::RuleReloadRejected,
                    TelemetrySample::new("policy", "reload_rejected", err.to_string()),
                );
                log::error!(
                    "rejected rule reload from {origin}: {err}; generation {} ({}) stays live",
                    live.generation(),
                    live.version()
                );
                return Err(err);
            }
        };

        let mut current = self.current.write();
        if current.fingerprint() == set.fingerprint() {
            log::debug!("rule document from {origin} unchanged");
            return Ok(ReloadOutcome::Unchanged {
                generation: current.generation(),
            });
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let set = set.with_generation(generation);
        log::info!(
            "rules {} -> {} (generation {generation}, {} rules) from {origin}",
            current.version(),
            set.version(),
            set.len()
        );
        *current = Arc::new(set);
        drop(current);
        self.counters.event(
            Counter::RuleReloads,
            TelemetrySample::new("policy", "reload", format!("generation {generation}")),
        );
        Ok(ReloadOutcome::Swapped { generation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const V1: &str = "version = \"v1\"\n[[rules]]\nid = \"r\"\nwhen = \"band == low\"\naction = \"allow\"\n";
    const V2: &str = "version = \"v2\"\n[[rules]]\nid = \"r\"\nwhen = \"band == low\"\naction = \"warn\"\n";

    #[test]
    fn reload_swaps_generation_and_old_snapshots_survive() {
        let store = RuleStore::new(
            RuleSet::parse(V1, RuleFormat::Toml).unwrap(),
            None,
            FunnelCounters::shared(),
        );
        let before = store.snapshot();
        assert_eq!(before.generation(), 1);

        let outcome = store.reload_from_str(V2, RuleFormat::Toml).unwrap();
        assert_eq!(outcome, ReloadOutcome::Swapped { generation: 2 });
        assert_eq!(store.snapshot().version(), "v2");
        // In-flight holders keep their generation.
        assert_eq!(before.version(), "v1");
        assert_eq!(before.generation(), 1);
    }

    #[test]
    fn identical_document_is_a_no_op() {
        let store = RuleStore::new(
            RuleSet::parse(V1, RuleFormat::Toml).unwrap(),
            None,
            FunnelCounters::shared(),
        );
        assert_eq!(
            store.reload_from_str(V1, RuleFormat::Toml).unwrap(),
            ReloadOutcome::Unchanged { generation: 1 }
        );
    }

    #[test]
    fn malformed_reload_keeps_prior_generation() {
        let counters = FunnelCounters::shared();
        let store = RuleStore::new(
            RuleSet::parse(V1, RuleFormat::Toml).unwrap(),
            None,
            Arc::clone(&counters),
        );
        let err = store
            .reload_from_str("[[rules]]\nid = \"x\"\nwhen = \"(\"\naction = \"block\"\n", RuleFormat::Toml)
            .unwrap_err();
        assert_eq!(err.code(), "CFN-2002");
        let live = store.snapshot();
        assert_eq!(live.version(), "v1");
        assert_eq!(live.generation(), 1);
        assert_eq!(counters.get(Counter::RuleReloadRejected), 1);
        assert_eq!(counters.get(Counter::RuleReloads), 0);
    }

    #[test]
    fn reload_rereads_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(&path, V1).unwrap();
        let store = RuleStore::from_path(&path, FunnelCounters::shared()).unwrap();
        assert_eq!(store.source(), Some(path.as_path()));

        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(V2.as_bytes()).unwrap();
        drop(f);
        assert_eq!(store.reload().unwrap().generation(), 2);
        assert_eq!(store.snapshot().version(), "v2");

        std::fs::remove_file(&path).unwrap();
        assert_eq!(store.reload().unwrap_err().code(), "CFN-3002");
        assert_eq!(store.snapshot().version(), "v2");
    }

    #[test]
    fn concurrent_readers_see_whole_generations() {
        let store = Arc::new(RuleStore::new(
            RuleSet::parse(V1, RuleFormat::Toml).unwrap(),
            None,
            FunnelCounters::shared(),
        ));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let set = store.snapshot();
                        let expected = if set.version() == "v1" { "allow" } else { "warn" };
                        let rule = set.rules().iter().find(|r| r.id == "r").unwrap();
                        assert_eq!(rule.action.to_string().to_lowercase(), expected);
                    }
                })
            })
            .collect();
        for i in 0..50 {
            let doc = if i % 2 == 0 { V2 } else { V1 };
            store.reload_from_str(doc, RuleFormat::Toml).unwrap();
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
