//! Parallel unit processing over a bounded queue.
//!
//! Producers block in [`FunnelWorkers::submit`] when `queue_depth` units are
//! waiting. Units are independent; the only state workers share is inside
//! [`Funnel`] (rule generation, token bucket, breaker, counters).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded};

use super::Funnel;
use crate::collector::RawUnit;
use crate::core::errors::{CfnError, Result};

/// One unit of work as it arrives.
#[derive(Debug, Clone)]
pub enum Job {
    /// Already-parsed detector output.
    Unit(RawUnit),
    /// One raw JSON line; `fallback_id` names it if it cannot be parsed.
    Line { line: String, fallback_id: String },
}

#[derive(Debug)]
struct Queued {
    job: Job,
    received: Instant,
}

/// Totals after the workers drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Units audited and delivered.
    pub processed: u64,
    /// Units whose audit or delivery failed (already alerted).
    pub failed: u64,
}

/// A fixed set of worker threads sharing one [`Funnel`].
#[derive(Debug)]
pub struct FunnelWorkers {
    tx: Option<Sender<Queued>>,
    handles: Vec<JoinHandle<()>>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl FunnelWorkers {
    /// Spawn `workers` threads behind a queue of `queue_depth`.
    pub fn start(funnel: Arc<Funnel>, workers: usize, queue_depth: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Queued>(queue_depth.max(1));
        let processed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(workers.max(1));
        for idx in 0..workers.max(1) {
            let rx = rx.clone();
            let funnel = Arc::clone(&funnel);
            let processed = Arc::clone(&processed);
            let failed = Arc::clone(&failed);
            let handle = thread::Builder::new()
                .name(format!("cfn-worker-{idx}"))
                .spawn(move || work(&funnel, &rx, &processed, &failed))
                .map_err(|e| CfnError::Runtime {
                    details: format!("failed to spawn funnel worker {idx}: {e}"),
                })?;
            handles.push(handle);
        }
        Ok(Self {
            tx: Some(tx),
            handles,
            processed,
            failed,
        })
    }

    /// Queue one job, blocking while the queue is full.
    pub fn submit(&self, job: Job) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(CfnError::ChannelClosed {
            component: "funnel workers",
        })?;
        tx.send(Queued {
            job,
            received: Instant::now(),
        })
        .map_err(|_| CfnError::ChannelClosed {
            component: "funnel workers",
        })
    }

    /// Units waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.as_ref().map_or(0, Sender::len)
    }

    /// Totals so far.
    #[must_use]
    pub fn report(&self) -> WorkerReport {
        WorkerReport {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, let the queue drain, and join every worker.
    pub fn shutdown(mut self) -> WorkerReport {
        self.tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("funnel worker panicked during drain");
            }
        }
        self.report()
    }
}

impl Drop for FunnelWorkers {
    fn drop(&mut self) {
        // Closing the queue is enough; workers finish what is queued.
        self.tx.take();
    }
}

fn work(funnel: &Funnel, rx: &Receiver<Queued>, processed: &AtomicU64, failed: &AtomicU64) {
    for Queued { job, received } in rx {
        let outcome = match job {
            Job::Unit(raw) => funnel.process_received(raw, received),
            Job::Line { line, fallback_id } => {
                funnel.process_json_received(&line, &fallback_id, received)
            }
        };
        match outcome {
            Ok(_) => processed.fetch_add(1, Ordering::Relaxed),
            Err(e) => {
                log::error!("unit not acknowledged: {e}");
                failed.fetch_add(1, Ordering::Relaxed)
            }
        };
    }
}
