//! The arbitration client: one escalation request in, one verdict out.
//!
//! Every attempt asks the breaker first, runs on the bounded pool, and waits
//! no longer than `min(attempt_timeout, time left)`. Failed attempts are
//! retried with exponential backoff plus jitter while the deadline allows.
//! No path blocks past the request deadline and no path returns an error:
//! failure is expressed as a degraded [`Verdict`].

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use rand::Rng;

use super::breaker::{Admission, CircuitBreaker};
use super::pool::{ArbitrationPool, PoolRejected};
use super::{ArbitrationCall, RemoteArbiter, RemoteError, RemoteJudgment, summarize};
use crate::core::config::ArbitrationConfig;
use crate::core::errors::{CfnError, Result};
use crate::core::evidence::{EscalationRequest, Verdict, VerdictStatus};
use crate::monitor::telemetry::{Counter, FunnelCounters, TelemetrySample};

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling on any single delay, before jitter.
    pub max: Duration,
    /// Fraction of the computed delay added at random (0.0..=1.0).
    pub jitter: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &ArbitrationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn backoff<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        delay + delay.mul_f64(rng.random_range(0.0..=self.jitter))
    }
}

/// Deadline-bounded remote arbitration.
#[derive(Debug)]
pub struct ArbitrationClient {
    pool: ArbitrationPool,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    request_deadline: Duration,
    acquire_wait: Duration,
    summary_max_chars: usize,
    counters: Arc<FunnelCounters>,
}

impl ArbitrationClient {
    /// Spawn the worker pool around `arbiter`.
    pub fn new(
        config: &ArbitrationConfig,
        breaker: Arc<CircuitBreaker>,
        arbiter: Arc<dyn RemoteArbiter>,
        counters: Arc<FunnelCounters>,
    ) -> Result<Self> {
        let pool = ArbitrationPool::new(config.max_in_flight, arbiter).map_err(|e| {
            CfnError::Runtime {
                details: format!("failed to spawn arbitration workers: {e}"),
            }
        })?;
        Ok(Self {
            pool,
            breaker,
            retry: RetryPolicy::from_config(config),
            attempt_timeout: config.attempt_timeout(),
            request_deadline: config.request_deadline(),
            acquire_wait: config.acquire_wait(),
            summary_max_chars: config.summary_max_chars,
            counters,
        })
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn pool(&self) -> &ArbitrationPool {
        &self.pool
    }

    /// Arbitrate one escalation. Always returns within the request deadline
    /// (plus scheduling slack).
    pub fn arbitrate(&self, request: EscalationRequest) -> Verdict {
        let started = Instant::now();
        let deadline = request.deadline.min(started + self.request_deadline);
        let unit_id = request.detections.unit_id().to_string();
        let summary = summarize(&request.detections, &request.reason, self.summary_max_chars);
        let mut rng = rand::rng();
        let mut attempts = 0u32;
        let mut last: Option<(VerdictStatus, String)> = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let (status, why) =
                    last.unwrap_or((VerdictStatus::Timeout, "deadline elapsed".to_string()));
                return self.degraded(&unit_id, status, why, started, attempts);
            }

            let admission = self.breaker.admit();
            if !admission.is_admitted() {
                let (status, why) = last
                    .unwrap_or((VerdictStatus::CircuitOpen, "circuit breaker open".to_string()));
                return self.degraded(&unit_id, status, why, started, attempts);
            }

            let timeout = self.attempt_timeout.min(remaining);
            let call = ArbitrationCall {
                unit_id: unit_id.clone(),
                media_ref: request.media_ref.clone(),
                summary: summary.clone(),
                timeout,
            };
            let reply = match self.pool.submit(call, self.acquire_wait.min(remaining)) {
                Ok(reply) => reply,
                Err(rejected) => {
                    self.breaker.abandon(admission);
                    if rejected == PoolRejected::Saturated {
                        self.counters.event(
                            Counter::ArbitrationSaturated,
                            TelemetrySample::new("arbitration", "saturated", unit_id.clone()),
                        );
                    }
                    let (status, why) = last.unwrap_or((VerdictStatus::Error, rejected.to_string()));
                    return self.degraded(&unit_id, status, why, started, attempts);
                }
            };
            attempts += 1;
            self.counters.incr(Counter::ArbitrationAttempts);

            let outcome = match reply.recv_timeout(timeout) {
                Ok(result) => result.and_then(validate),
                Err(RecvTimeoutError::Timeout) => Err(RemoteError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(RemoteError::Transport("arbitration worker exited".to_string()))
                }
            };

            match outcome {
                Ok(judgment) => {
                    self.breaker.record(admission, true);
                    self.counters.incr(Counter::ArbitrationSuccess);
                    log::debug!("unit {unit_id}: arbitration succeeded after {attempts} attempt(s)");
                    return Verdict::success(
                        judgment.categories,
                        judgment.rationale,
                        elapsed_ms(started),
                        attempts,
                    );
                }
                Err(err) => {
                    self.breaker.record(admission, false);
                    log::debug!("unit {unit_id}: arbitration attempt {attempts} failed: {err}");
                    let status = match err {
                        RemoteError::Timeout => VerdictStatus::Timeout,
                        RemoteError::Transport(_) | RemoteError::Malformed(_) => VerdictStatus::Error,
                    };
                    last = Some((status, err.to_string()));
                }
            }

            if attempts > self.retry.max_retries {
                break;
            }
            let pause = self.retry.backoff(attempts - 1, &mut rng);
            if Instant::now() + pause >= deadline {
                break;
            }
            thread::sleep(pause);
        }

        let (status, why) = last.unwrap_or((VerdictStatus::Error, "no attempt made".to_string()));
        self.degraded(&unit_id, status, why, started, attempts)
    }

    fn degraded(
        &self,
        unit_id: &str,
        status: VerdictStatus,
        why: String,
        started: Instant,
        attempts: u32,
    ) -> Verdict {
        let counter = match status {
            VerdictStatus::Timeout => Counter::ArbitrationTimeout,
            VerdictStatus::CircuitOpen => Counter::ArbitrationCircuitOpen,
            VerdictStatus::Success | VerdictStatus::Error => Counter::ArbitrationError,
        };
        self.counters.event(
            counter,
            TelemetrySample::new("arbitration", "degraded", format!("{unit_id}: {status}: {why}")),
        );
        log::warn!("unit {unit_id}: arbitration degraded to {status} after {attempts} attempt(s): {why}");
        Verdict::failed(status, why, elapsed_ms(started), attempts)
    }
}

fn validate(judgment: RemoteJudgment) -> std::result::Result<RemoteJudgment, RemoteError> {
    for score in &judgment.categories {
        if score.category.trim().is_empty() {
            return Err(RemoteError::Malformed("empty category name".to_string()));
        }
        if !(score.confidence.is_finite() && (0.0..=1.0).contains(&score.confidence)) {
            return Err(RemoteError::Malformed(format!(
                "category {} confidence {} outside [0, 1]",
                score.category, score.confidence
            )));
        }
    }
    Ok(judgment)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BreakerConfig;
    use crate::core::evidence::{CategoryScore, DetectionCandidate, DetectionSet, EscalationReason};
    use parking_lot::Mutex;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Reply = std::result::Result<RemoteJudgment, RemoteError>;

    /// Replays a script of responses; repeats the last one when exhausted.
    struct ScriptedArbiter {
        script: Mutex<VecDeque<Reply>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedArbiter {
        fn new(script: Vec<Reply>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemoteArbiter for ScriptedArbiter {
        fn judge(&self, _call: &ArbitrationCall) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap_or(Err(RemoteError::Timeout))
            } else {
                script.front().cloned().unwrap_or(Err(RemoteError::Timeout))
            }
        }
    }

    fn weapon(conf: f64) -> RemoteJudgment {
        RemoteJudgment {
            categories: vec![CategoryScore::new("weapon", conf)],
            rationale: "blade visible".to_string(),
        }
    }

    fn config() -> ArbitrationConfig {
        ArbitrationConfig {
            attempt_timeout_ms: 60,
            request_deadline_ms: 500,
            max_retries: 2,
            backoff_base_ms: 5,
            backoff_max_ms: 20,
            jitter: 0.0,
            max_in_flight: 4,
            acquire_wait_ms: 50,
            ..ArbitrationConfig::default()
        }
    }

    fn lenient_breaker(counters: &Arc<FunnelCounters>) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            &BreakerConfig {
                min_calls: 100,
                ..BreakerConfig::default()
            },
            Arc::clone(counters),
        ))
    }

    fn request(deadline: Duration) -> EscalationRequest {
        let set = DetectionSet::new(
            "frame-9",
            None,
            vec![DetectionCandidate::visual("knife", 0.6).unwrap()],
        );
        EscalationRequest::new(
            Arc::new(set),
            EscalationReason::AmbiguousCandidate {
                label: "knife".to_string(),
                confidence: 0.6,
            },
            Instant::now() + deadline,
        )
    }

    fn client(arbiter: Arc<ScriptedArbiter>) -> (ArbitrationClient, Arc<FunnelCounters>) {
        let counters = FunnelCounters::shared();
        let breaker = lenient_breaker(&counters);
        let c = ArbitrationClient::new(&config(), breaker, arbiter, Arc::clone(&counters)).unwrap();
        (c, counters)
    }

    #[test]
    fn first_attempt_success() {
        let arbiter = ScriptedArbiter::new(vec![Ok(weapon(0.95))], Duration::ZERO);
        let (c, counters) = client(Arc::clone(&arbiter));
        let v = c.arbitrate(request(Duration::from_secs(2)));
        assert_eq!(v.status(), VerdictStatus::Success);
        assert_eq!(v.attempts(), 1);
        assert_eq!(v.category_confidence("weapon"), Some(0.95));
        assert_eq!(counters.get(Counter::ArbitrationSuccess), 1);
    }

    #[test]
    fn transient_failure_is_retried() {
        let arbiter = ScriptedArbiter::new(
            vec![Err(RemoteError::Transport("503".to_string())), Ok(weapon(0.8))],
            Duration::ZERO,
        );
        let (c, counters) = client(Arc::clone(&arbiter));
        let v = c.arbitrate(request(Duration::from_secs(2)));
        assert!(v.is_success());
        assert_eq!(v.attempts(), 2);
        assert_eq!(counters.get(Counter::ArbitrationAttempts), 2);
    }

    #[test]
    fn persistent_timeouts_degrade_within_deadline() {
        let arbiter = ScriptedArbiter::new(vec![Ok(weapon(0.9))], Duration::from_millis(250));
        let (c, counters) = client(Arc::clone(&arbiter));
        let started = Instant::now();
        let v = c.arbitrate(request(Duration::from_secs(2)));
        assert_eq!(v.status(), VerdictStatus::Timeout);
        assert_eq!(v.attempts(), 3);
        assert!(v.categories().is_empty());
        // request_deadline is 500 ms; allow scheduling slack.
        assert!(started.elapsed() < Duration::from_millis(900));
        assert_eq!(counters.get(Counter::ArbitrationTimeout), 1);
    }

    #[test]
    fn unit_deadline_caps_request_deadline() {
        let arbiter = ScriptedArbiter::new(vec![Ok(weapon(0.9))], Duration::from_millis(250));
        let (c, _) = client(arbiter);
        let started = Instant::now();
        let v = c.arbitrate(request(Duration::from_millis(80)));
        assert_eq!(v.status(), VerdictStatus::Timeout);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn elapsed_deadline_makes_no_call() {
        let arbiter = ScriptedArbiter::new(vec![Ok(weapon(0.9))], Duration::ZERO);
        let (c, _) = client(Arc::clone(&arbiter));
        let v = c.arbitrate(request(Duration::ZERO));
        assert_eq!(v.status(), VerdictStatus::Timeout);
        assert_eq!(v.attempts(), 0);
        assert_eq!(arbiter.calls(), 0);
    }

    #[test]
    fn open_breaker_short_circuits_without_remote_call() {
        let arbiter = ScriptedArbiter::new(vec![Ok(weapon(0.9))], Duration::ZERO);
        let counters = FunnelCounters::shared();
        let breaker = Arc::new(CircuitBreaker::new(
            &BreakerConfig {
                min_calls: 1,
                failure_rate: 1.0,
                cooldown_secs: 60,
                ..BreakerConfig::default()
            },
            Arc::clone(&counters),
        ));
        breaker.record(Admission::Allowed, false);
        let c = ArbitrationClient::new(
            &config(),
            breaker,
            Arc::clone(&arbiter) as Arc<dyn RemoteArbiter>,
            Arc::clone(&counters),
        )
        .unwrap();

        let started = Instant::now();
        let v = c.arbitrate(request(Duration::from_secs(2)));
        assert_eq!(v.status(), VerdictStatus::CircuitOpen);
        assert_eq!(v.attempts(), 0);
        assert_eq!(arbiter.calls(), 0);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(counters.get(Counter::ArbitrationCircuitOpen), 1);
    }

    #[test]
    fn repeated_failures_open_the_breaker_mid_retry() {
        let arbiter = ScriptedArbiter::new(
            vec![Err(RemoteError::Transport("down".to_string()))],
            Duration::ZERO,
        );
        let counters = FunnelCounters::shared();
        let breaker = Arc::new(CircuitBreaker::new(
            &BreakerConfig {
                min_calls: 2,
                failure_rate: 0.5,
                cooldown_secs: 60,
                ..BreakerConfig::default()
            },
            Arc::clone(&counters),
        ));
        let c = ArbitrationClient::new(
            &config(),
            breaker,
            Arc::clone(&arbiter) as Arc<dyn RemoteArbiter>,
            Arc::clone(&counters),
        )
        .unwrap();
        let v = c.arbitrate(request(Duration::from_secs(2)));
        assert_eq!(v.status(), VerdictStatus::Error);
        assert_eq!(v.attempts(), 2, "third attempt rejected by the open breaker");
        assert_eq!(counters.get(Counter::BreakerOpened), 1);

        let next = c.arbitrate(request(Duration::from_secs(2)));
        assert_eq!(next.status(), VerdictStatus::CircuitOpen);
        assert_eq!(arbiter.calls(), 2);
    }

    #[test]
    fn out_of_range_confidence_is_an_error() {
        let arbiter = ScriptedArbiter::new(vec![Ok(weapon(1.5))], Duration::ZERO);
        let (c, _) = client(arbiter);
        let v = c.arbitrate(request(Duration::from_secs(2)));
        assert_eq!(v.status(), VerdictStatus::Error);
        assert!(v.failure().unwrap().contains("outside [0, 1]"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base: Duration::from_millis(10),
            max: Duration::from_millis(35),
            jitter: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<_> = (0..4).map(|r| policy.backoff(r, &mut rng)).collect();
        assert_eq!(
            delays,
            [10, 20, 35, 35].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = RetryPolicy {
            max_retries: 5,
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.25,
        };
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = policy.backoff(0, &mut rng);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(125), "{d:?}");
        }
    }
}
