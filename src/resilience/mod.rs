//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to upstream:
//!     → per-attempt timeout (http/server.rs)
//!     → On failure: retries.rs (check if retryable and within budget)
//!     → backoff.rs (sleep before the next attempt)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every upstream call has a deadline
//! - Retries only for idempotent requests (GET, HEAD, etc.)
//! - Budgeted so a failing upstream does not multiply load

pub mod backoff;
pub mod retries;

pub use backoff::calculate_backoff;
pub use retries::{is_retryable, RetryBudget};
