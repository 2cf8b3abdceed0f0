//! Adaptive per-model rate limiting for remote API backends.
//!
//! Providers report their limits in `x-ratelimit-*` response headers. Once a
//! window is exhausted, further requests for that model wait until it resets.
//! Consecutive 429s add an exponential cool-down on top.

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAX_COOLDOWN_SECS: f64 = 60.0;

/// A request or token window as last reported by the provider.
#[derive(Debug, Default, Clone, Copy)]
struct Window {
    remaining: Option<u64>,
    resets_at: Option<Instant>,
}

impl Window {
    fn blocked_for(&self, now: Instant) -> Duration {
        match (self.remaining, self.resets_at) {
            (Some(0), Some(at)) if at > now => at - now,
            _ => Duration::ZERO,
        }
    }

    fn observe(&mut self, headers: &HeaderMap, remaining_key: &str, reset_key: &str, now: Instant) {
        if let Some(remaining) = header_value(headers, remaining_key).and_then(|s| s.parse().ok()) {
            self.remaining = Some(remaining);
        }
        let reset = header_value(headers, reset_key)
            .and_then(|s| parse_reset_secs(&s))
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .and_then(|delay| now.checked_add(delay));
        if let Some(at) = reset {
            self.resets_at = Some(at);
        }
    }
}

/// Limit state for one model.
#[derive(Debug, Default)]
struct ModelState {
    requests: Window,
    tokens: Window,
    consecutive_429s: u32,
    cooldown_until: Option<Instant>,
}

impl ModelState {
    fn wait_time(&self, now: Instant) -> Duration {
        let cooldown = match self.cooldown_until {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        };
        cooldown
            .max(self.requests.blocked_for(now))
            .max(self.tokens.blocked_for(now))
    }

    fn on_throttled(&mut self, model: &str) {
        self.consecutive_429s += 1;
        let secs = 2f64.powi(self.consecutive_429s as i32).min(MAX_COOLDOWN_SECS);
        self.cooldown_until = Some(Instant::now() + Duration::from_secs_f64(secs));
        warn!(
            model,
            consecutive_429s = self.consecutive_429s,
            cooldown_secs = secs,
            "Rate limited (429), cooling down"
        );
    }

    fn on_success(&mut self) {
        self.consecutive_429s = 0;
        self.cooldown_until = None;
    }
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers.get(key)?.to_str().ok().map(str::to_string)
}

/// Reset hints come as plain seconds ("1.5") or with a unit suffix ("20ms", "6s").
/// Negative or non-finite values are discarded.
fn parse_reset_secs(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let secs = match raw.strip_suffix("ms") {
        Some(ms) => ms.parse::<f64>().ok()? / 1000.0,
        None => raw.strip_suffix('s').unwrap_or(raw).parse::<f64>().ok()?,
    };
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

/// Shared limiter across every worker of a backend.
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: DashMap<String, ModelState>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until the model's limits allow another request. Returns the time waited.
    pub async fn wait_if_needed(&self, model: &str) -> Duration {
        let wait = self
            .states
            .get(model)
            .map(|state| state.wait_time(Instant::now()))
            .unwrap_or(Duration::ZERO);

        if !wait.is_zero() {
            debug!(model, wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record a response status and its limit headers.
    pub fn record_response(&self, model: &str, status: u16, headers: &HeaderMap) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut state = self.states.entry(model.to_string()).or_default();
        state.requests.observe(
            headers,
            "x-ratelimit-remaining-requests",
            "x-ratelimit-reset-requests",
            now,
        );
        state.tokens.observe(
            headers,
            "x-ratelimit-remaining-tokens",
            "x-ratelimit-reset-tokens",
            now,
        );

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            state.on_throttled(model);
        } else if status < 400 {
            state.on_success();
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_429s: self.total_429s.load(Ordering::Relaxed),
            total_wait: Duration::from_millis(self.total_wait_ms.load(Ordering::Relaxed)),
            models_tracked: self.states.len(),
        }
    }
}

/// Rate limiter counters.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait: Duration,
    pub models_tracked: usize,
}
