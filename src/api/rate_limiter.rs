// src/api/rate_limiter.rs
//! Per-service admission gate
//!
//! Three layered checks decide whether the next queued request may go out:
//! - a token bucket that absorbs bursts up to `burst_size`
//! - a one-minute sliding window holding the hard `max_requests_per_minute` ceiling
//! - a minimum spacing of `60s / max_requests_per_minute` between dispatches

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ServiceConfig;

pub const WINDOW: Duration = Duration::from_secs(60);

/// Floor for a refused-admission wait so the scheduler never spins
pub const MIN_ADMISSION_WAIT: Duration = Duration::from_millis(1);

fn tokens_per_ms(config: &ServiceConfig) -> f64 {
    config.max_requests_per_minute as f64 / WINDOW.as_millis() as f64
}

fn min_interval(config: &ServiceConfig) -> Duration {
    WINDOW / config.max_requests_per_minute.max(1)
}

/// Continuously refilled burst allowance
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn full(config: &ServiceConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst_size as f64,
            last_refill: now,
        }
    }

    pub fn refill(&mut self, config: &ServiceConfig, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens =
            (self.tokens + elapsed_ms * tokens_per_ms(config)).min(config.burst_size as f64);
        self.last_refill = self.last_refill.max(now);
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn time_until_token(&self, config: &ServiceConfig) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let missing_ms = (1.0 - self.tokens) / tokens_per_ms(config);
        Duration::from_secs_f64(missing_ms / 1000.0)
    }
}

/// Sliding log of dispatch instants over the last minute
#[derive(Debug, Clone, Default)]
pub struct AdmissionWindow {
    dispatches: VecDeque<Instant>,
    last_dispatch: Option<Instant>,
}

impl AdmissionWindow {
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.dispatches.front() {
            if now.saturating_duration_since(*front) >= WINDOW {
                self.dispatches.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    pub fn last_dispatch(&self) -> Option<Instant> {
        self.last_dispatch
    }

    fn record(&mut self, now: Instant) {
        self.dispatches.push_back(now);
        self.last_dispatch = Some(now);
    }

    fn time_until_slot(&self, config: &ServiceConfig, now: Instant) -> Duration {
        if self.dispatches.len() < config.max_requests_per_minute as usize {
            return Duration::ZERO;
        }
        // The window is full: the oldest entry has to age out first
        self.dispatches
            .front()
            .map(|oldest| (*oldest + WINDOW).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn time_until_spacing(&self, config: &ServiceConfig, now: Instant) -> Duration {
        self.last_dispatch
            .map(|last| (last + min_interval(config)).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Refused; nothing can be admitted for at least this long
    Denied { retry_after: Duration },
}

/// Bucket + window for one service
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    bucket: TokenBucket,
    window: AdmissionWindow,
}

impl AdmissionGate {
    pub fn new(config: &ServiceConfig, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::full(config, now),
            window: AdmissionWindow::default(),
        }
    }

    /// Runs the checks in order and, only when all pass, consumes a token and
    /// records the dispatch.
    pub fn check(&mut self, config: &ServiceConfig, now: Instant) -> Admission {
        self.bucket.refill(config, now);
        self.window.prune(now);

        let token_ok = self.bucket.tokens() >= 1.0;
        let window_ok = self.window.len() < config.max_requests_per_minute as usize;
        let spacing_ok = self.window.time_until_spacing(config, now).is_zero();

        if token_ok && window_ok && spacing_ok {
            self.bucket.tokens -= 1.0;
            self.window.record(now);
            return Admission::Granted;
        }

        let retry_after = self
            .bucket
            .time_until_token(config)
            .max(self.window.time_until_slot(config, now))
            .max(self.window.time_until_spacing(config, now))
            .max(MIN_ADMISSION_WAIT);
        Admission::Denied { retry_after }
    }

    /// Token level after a lazy refill
    pub fn tokens(&mut self, config: &ServiceConfig, now: Instant) -> f64 {
        self.bucket.refill(config, now);
        self.bucket.tokens()
    }

    /// Dispatches still inside the one-minute window
    pub fn recent_count(&mut self, now: Instant) -> usize {
        self.window.prune(now);
        self.window.len()
    }

    pub fn window(&self) -> &AdmissionWindow {
        &self.window
    }

    pub fn reset(&mut self, config: &ServiceConfig, now: Instant) {
        *self = Self::new(config, now);
    }
}
