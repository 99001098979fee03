//! Retry logic.
//!
//! # Responsibilities
//! - Determine if request is retryable (idempotent methods only)
//! - Enforce retry budget (retries as a share of requests)
//!
//! # Design Decisions
//! - Never retry POST/PATCH (non-idempotent)
//! - Retry budget prevents retry storms under load
//! - Connection errors and 502/503/504 are retryable

use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::{Method, StatusCode};

/// Requests counted before the budget window starts over.
const BUDGET_WINDOW: u64 = 10_000;

/// Whether a failed attempt may be retried.
///
/// `status` is the upstream response status, or `None` when no response
/// arrived; `connect_error` marks failures to reach the upstream at all.
pub fn is_retryable(method: &Method, status: Option<StatusCode>, connect_error: bool) -> bool {
    if !method.is_idempotent() {
        return false;
    }

    if connect_error {
        return true;
    }

    matches!(
        status,
        Some(StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT)
    )
}

/// Caps retries at `min_retries + ratio * requests` per window.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f64,
    min_retries: u64,
    requests: AtomicU64,
    retries: AtomicU64,
}

impl RetryBudget {
    pub fn new(ratio: f32, min_retries: u64) -> Self {
        Self {
            ratio: f64::from(ratio.clamp(0.0, 1.0)),
            min_retries,
            requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Count an original (non-retry) request.
    pub fn record_request(&self) {
        let seen = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if seen >= BUDGET_WINDOW {
            self.requests.store(0, Ordering::Relaxed);
            self.retries.store(0, Ordering::Relaxed);
        }
    }

    /// Withdraw one retry from the budget; false when exhausted.
    pub fn can_retry(&self) -> bool {
        let mut current = self.retries.load(Ordering::Relaxed);
        loop {
            let allowed =
                self.min_retries + (self.requests.load(Ordering::Relaxed) as f64 * self.ratio) as u64;
            if current >= allowed {
                return false;
            }
            match self.retries.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
