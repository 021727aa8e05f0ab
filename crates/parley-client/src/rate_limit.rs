//! Per-actor send throttling, consulted before a message is written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, rate: f64, capacity: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
    }

    fn try_consume(&mut self, rate: f64, capacity: f64, now: Instant) -> bool {
        self.refill(rate, capacity, now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole seconds until one token is available again.
    fn retry_after_secs(&self, rate: f64) -> u64 {
        let missing = (1.0 - self.tokens).max(0.0);
        (missing / rate).ceil() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

struct Buckets {
    by_actor: HashMap<String, TokenBucket>,
    last_purge: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<Buckets>>,
    rate: f64,
    capacity: f64,
    /// A bucket idle this long has refilled completely and can be dropped.
    idle_after: Duration,
}

impl RateLimiter {
    /// `max_requests` per `window_secs`, with the whole allowance available
    /// as an initial burst.
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        let capacity = f64::from(max_requests.max(1));
        let window_secs = window_secs.max(1);
        Self {
            state: Arc::new(Mutex::new(Buckets {
                by_actor: HashMap::new(),
                last_purge: Instant::now(),
            })),
            rate: capacity / window_secs as f64,
            capacity,
            idle_after: Duration::from_secs(window_secs),
        }
    }

    pub fn check(&self, actor: &str) -> RateDecision {
        self.check_at(actor, Instant::now())
    }

    /// Give back the token taken by the last allowed [`check`](Self::check),
    /// for work that was refused after the gate.
    pub fn refund(&self, actor: &str) {
        let mut state = self.state();
        if let Some(bucket) = state.by_actor.get_mut(actor) {
            bucket.tokens = (bucket.tokens + 1.0).min(self.capacity);
        }
    }

    fn check_at(&self, actor: &str, now: Instant) -> RateDecision {
        let mut state = self.state();
        if now.saturating_duration_since(state.last_purge) >= self.idle_after {
            self.purge_idle(&mut state, now);
        }

        let bucket = state
            .by_actor
            .entry(actor.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, now));

        if bucket.try_consume(self.rate, self.capacity, now) {
            RateDecision {
                allowed: true,
                retry_after_secs: 0,
            }
        } else {
            let retry_after_secs = bucket.retry_after_secs(self.rate).max(1);
            warn!(actor, retry_after_secs, "Send rate limit exceeded");
            RateDecision {
                allowed: false,
                retry_after_secs,
            }
        }
    }

    fn purge_idle(&self, state: &mut Buckets, now: Instant) {
        let before = state.by_actor.len();
        let idle_after = self.idle_after;
        state
            .by_actor
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle_after);
        state.last_purge = now;

        let purged = before - state.by_actor.len();
        if purged > 0 {
            debug!(purged, "Dropped idle rate limit buckets");
        }
    }

    // A poisoned map only holds bucket counters, so keep using it.
    fn state(&self) -> MutexGuard<'_, Buckets> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10, 60)
    }
}
