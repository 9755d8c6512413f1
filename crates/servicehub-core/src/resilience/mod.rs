//! Resilience patterns for the broker boundary.
//!
//! Retries with exponential backoff and jitter live here. Rate limiting for
//! auto-replay rules is deliberately *not* a token bucket — see
//! [`crate::rules::executor`] — it is computed fresh from persisted replay
//! history on every check, so there is no in-memory counter to drift.

mod retry;

pub use retry::{AdaptiveRetry, RetryBudget, RetryConfig, RetryError, RetryExecutor, RetryPolicy};
