//! # Utilities Module
//!
//! ## Purpose
//! Small shared helpers: the per-request latency clock that feeds
//! `latency_ms` in query runs and telemetry, and the process-wide
//! leaky-bucket rate limiter guarding external calls and the inbound query
//! surface.

use parking_lot::Mutex;
use std::time::Instant;

/// Wall clock for one request. Tracks total elapsed time (what `latency_ms`
/// reports to the audit record and telemetry) and logs per-stage checkpoint
/// durations as the pipeline advances.
pub struct LatencyClock {
    start: Instant,
    last_lap: Instant,
}

impl LatencyClock {
    /// Start the clock at request entry.
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_lap: now,
        }
    }

    /// Total milliseconds since the request started.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Close out a pipeline stage: logs and returns the milliseconds spent
    /// since the previous checkpoint.
    pub fn lap(&mut self, stage: &str) -> u64 {
        let now = Instant::now();
        let stage_ms = now.duration_since(self.last_lap).as_millis() as u64;
        self.last_lap = now;
        tracing::debug!(stage, stage_ms, "pipeline stage complete");
        stage_ms
    }
}

struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

/// Leaky-bucket token pool shared across a process: `rate` tokens per second
/// refill up to `burst`.
pub struct LeakyBucket {
    rate: f64,
    burst: f64,
    inner: Mutex<BucketInner>,
}

impl LeakyBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate: rate.max(0.0),
            burst: burst.max(1.0),
            inner: Mutex::new(BucketInner {
                tokens: burst.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available; callers treat `false` as rate-limited.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.rate).min(self.burst);
        inner.last_refill = now;
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (diagnostics only).
    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.rate).min(self.burst);
        inner.last_refill = now;
        inner.tokens
    }
}
