//! Fixed worker pool that caps concurrent remote calls.
//!
//! Jobs are handed over a zero-capacity channel, so a submission only
//! succeeds when a worker is idle and waiting. The number of remote calls in
//! flight therefore never exceeds the worker count, and callers wait at most
//! `acquire_wait` for a slot before being told the pool is saturated.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use thiserror::Error;

use super::{ArbitrationCall, RemoteArbiter, RemoteError, RemoteJudgment};

/// Reply channel for one submitted call.
pub type Reply = Receiver<Result<RemoteJudgment, RemoteError>>;

struct PoolJob {
    call: ArbitrationCall,
    reply: Sender<Result<RemoteJudgment, RemoteError>>,
}

/// Why a call could not be handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolRejected {
    /// Every worker stayed busy for the whole acquire wait.
    #[error("arbitration pool saturated")]
    Saturated,
    /// The pool is shutting down.
    #[error("arbitration pool shut down")]
    ShutDown,
}

/// Bounded pool of arbitration workers.
pub struct ArbitrationPool {
    sender: Option<Sender<PoolJob>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ArbitrationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbitrationPool")
            .field("workers", &self.workers.len())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl ArbitrationPool {
    /// Spawn `size` workers (at least one) sharing `arbiter`.
    pub fn new(size: usize, arbiter: Arc<dyn RemoteArbiter>) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded::<PoolJob>(0);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(size.max(1));
        for idx in 0..size.max(1) {
            let receiver = receiver.clone();
            let arbiter = Arc::clone(&arbiter);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let handle = thread::Builder::new()
                .name(format!("cfn-arbiter-{idx}"))
                .spawn(move || {
                    for job in &receiver {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        let result = arbiter.judge(&job.call);
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        // The caller may have given up on this attempt.
                        let _ = job.reply.send(result);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
            in_flight,
            peak,
        })
    }

    /// Hand `call` to an idle worker, waiting at most `acquire_wait`.
    pub fn submit(&self, call: ArbitrationCall, acquire_wait: Duration) -> Result<Reply, PoolRejected> {
        let Some(sender) = &self.sender else {
            return Err(PoolRejected::ShutDown);
        };
        let (reply, rx) = crossbeam_channel::bounded(1);
        match sender.send_timeout(PoolJob { call, reply }, acquire_wait) {
            Ok(()) => Ok(rx),
            Err(SendTimeoutError::Timeout(_)) => Err(PoolRejected::Saturated),
            Err(SendTimeoutError::Disconnected(_)) => Err(PoolRejected::ShutDown),
        }
    }

    /// Calls currently executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrent call count observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Worker count.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work and wait for workers to finish their current call.
    pub fn shutdown(mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ArbitrationPool {
    fn drop(&mut self) {
        // Workers exit once the channel disconnects; a worker stuck in a slow
        // remote call is left to finish on its own rather than blocking drop.
        self.sender.take();
    }
}
