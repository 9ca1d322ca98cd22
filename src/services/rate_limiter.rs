//! In-memory token-bucket admission control.
//!
//! One bucket per key, refilled continuously at `capacity / window` and capped
//! at `capacity`. Two instances run side by side: one keyed by account, one by
//! client address. Remaining tokens come straight from the bucket; a separate
//! per-window counter is kept only for usage reporting.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// End of the current reporting window.
    pub reset_at: DateTime<Utc>,
    /// How long until the next token is available; zero when allowed.
    pub retry_after: Duration,
}

/// Requests admitted in the current reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    pub count: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    window: Duration,
    window_start: Instant,
    window_count: u32,
    last_access: Instant,
}

impl Bucket {
    fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        let mut bucket = Self {
            tokens: f64::from(capacity),
            capacity: 0.0,
            refill_per_sec: 0.0,
            last_refill: now,
            window,
            window_start: now,
            window_count: 0,
            last_access: now,
        };
        bucket.configure(capacity, window);
        bucket
    }

    /// Adopt new limits (e.g. after a plan change) without refilling.
    fn configure(&mut self, capacity: u32, window: Duration) {
        self.capacity = f64::from(capacity);
        self.refill_per_sec = f64::from(capacity) / window.as_secs_f64().max(f64::EPSILON);
        self.window = window;
        self.tokens = self.tokens.min(self.capacity);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn roll_window(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.window_count = 0;
        }
    }

    fn try_consume(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn until_next_token(&self) -> Duration {
        if self.tokens >= 1.0 || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
    }
}

/// Result of the locked section, expressed in monotonic durations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Check {
    pub allowed: bool,
    pub remaining: u32,
    pub window_left: Duration,
    pub retry_after: Duration,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one token for `key` if one is available.
    pub fn allow(&self, key: &str, capacity: u32, window: Duration) -> RateDecision {
        let wall = Utc::now();
        let check = self.check_at(key, capacity, window, Instant::now());
        RateDecision {
            allowed: check.allowed,
            limit: capacity,
            remaining: check.remaining,
            reset_at: wall + to_chrono(check.window_left),
            retry_after: check.retry_after,
        }
    }

    pub(crate) fn check_at(&self, key: &str, capacity: u32, window: Duration, now: Instant) -> Check {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(capacity, window, now));
        if bucket.capacity != f64::from(capacity) || bucket.window != window {
            bucket.configure(capacity, window);
        }

        bucket.refill(now);
        bucket.roll_window(now);
        bucket.last_access = bucket.last_access.max(now);

        let allowed = bucket.try_consume();
        if allowed {
            bucket.window_count = bucket.window_count.saturating_add(1);
        }

        Check {
            allowed,
            remaining: bucket.tokens.floor().max(0.0) as u32,
            window_left: (bucket.window_start + bucket.window).saturating_duration_since(now),
            retry_after: bucket.until_next_token(),
        }
    }

    /// Requests admitted for `key` in its current window. Unknown keys and
    /// lapsed windows report zero.
    pub fn window_usage(&self, key: &str) -> WindowUsage {
        let now = Instant::now();
        let wall = Utc::now();
        let buckets = self.buckets.lock();
        match buckets.get(key) {
            Some(bucket) if now.saturating_duration_since(bucket.window_start) < bucket.window => {
                let left = (bucket.window_start + bucket.window).saturating_duration_since(now);
                WindowUsage {
                    count: bucket.window_count,
                    reset_at: Some(wall + to_chrono(left)),
                }
            }
            _ => WindowUsage {
                count: 0,
                reset_at: None,
            },
        }
    }

    /// Drop buckets idle for longer than `max_idle`. Returns how many went.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        self.sweep_at(max_idle, Instant::now())
    }

    pub(crate) fn sweep_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_access) <= max_idle);
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}
