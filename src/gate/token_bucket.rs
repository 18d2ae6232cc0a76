//! Token-bucket rate limiter for escalations.
//!
//! Holds `capacity` tokens, refilled continuously at `refill_per_sec`. Over
//! any window of length `w` at most `capacity + refill_per_sec * w` tokens can
//! be taken. The critical section is a handful of float ops under a
//! `parking_lot` mutex, so contention stays negligible next to a remote call.

use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Shared escalation budget. Inject one `Arc<TokenBucket>` into every gate
/// that draws from the same budget.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket.
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self::new_at(capacity, refill_per_sec, Instant::now())
    }

    /// A full bucket whose refill clock starts at `now`.
    #[must_use]
    pub fn new_at(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Take one token as of `now`. Times earlier than the last refill are
    /// treated as the last refill (no negative elapsed time).
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available as of `now` (fractional).
    #[must_use]
    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    #[must_use]
    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = elapsed
            .as_secs_f64()
            .mul_add(self.refill_per_sec, state.tokens)
            .min(self.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::TokenBucket;
    use proptest::prelude::*;
    use std::time::{Duration, Instant};

    #[test]
    fn burst_then_empty() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new_at(3, 1.0, t0);
        assert!(bucket.try_acquire_at(t0));
        assert!(bucket.try_acquire_at(t0));
        assert!(bucket.try_acquire_at(t0));
        assert!(!bucket.try_acquire_at(t0));
    }

    #[test]
    fn refills_over_time_up_to_capacity() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new_at(2, 2.0, t0);
        assert!(bucket.try_acquire_at(t0));
        assert!(bucket.try_acquire_at(t0));
        assert!(!bucket.try_acquire_at(t0));
        // 0.5 s at 2/s = one token.
        assert!(bucket.try_acquire_at(t0 + Duration::from_millis(500)));
        assert!(!bucket.try_acquire_at(t0 + Duration::from_millis(500)));
        // A long idle period never exceeds capacity.
        let later = t0 + Duration::from_secs(3600);
        assert!((bucket.available_at(later) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn earlier_timestamps_do_not_refill() {
        let t0 = Instant::now() + Duration::from_secs(10);
        let bucket = TokenBucket::new_at(1, 100.0, t0);
        assert!(bucket.try_acquire_at(t0));
        assert!(!bucket.try_acquire_at(t0 - Duration::from_secs(5)));
    }

    proptest! {
        #[test]
        fn sliding_window_never_exceeds_cap(
            capacity in 1u32..20,
            rate in 0.5f64..50.0,
            gaps in proptest::collection::vec(0u64..200, 1..300),
            window_ms in 10u64..2000,
        ) {
            let t0 = Instant::now();
            let bucket = TokenBucket::new_at(capacity, rate, t0);
            let mut now = t0;
            let mut granted = Vec::new();
            for gap in gaps {
                now += Duration::from_millis(gap);
                if bucket.try_acquire_at(now) {
                    granted.push(now);
                }
            }
            let window = Duration::from_millis(window_ms);
            let cap = f64::from(capacity) + rate * window.as_secs_f64();
            for (i, start) in granted.iter().enumerate() {
                let in_window = granted[i..]
                    .iter()
                    .take_while(|t| t.duration_since(*start) <= window)
                    .count();
                #[allow(clippy::cast_precision_loss)]
                let count = in_window as f64;
                prop_assert!(count <= cap + 1e-9, "{count} grants in {window:?} > cap {cap}");
            }
        }
    }
}
