//! Strategy traits abstracting local and distributed enforcement.
//!
//! The admission pipeline consumes these traits and never learns whether
//! enforcement is process-local or shared through Redis; the variant is
//! selected once at startup.

use std::time::Duration;

use async_trait::async_trait;

use super::dedupe::DuplicateDetector;
use super::ratelimit::FixedWindowLimiter;

/// Trait for rate limiter implementations.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Record a hit for `key` and report whether it stays within `limit`
    /// for the current window.
    async fn allow(&self, key: &str, limit: u32, window: Duration) -> bool;
}

/// Trait for duplicate detector implementations.
#[async_trait]
pub trait DuplicateDetectorBackend: Send + Sync {
    /// Report whether `key` was observed within the last `window`,
    /// recording it on a miss.
    async fn seen_recently(&self, key: &str, window: Duration) -> bool;
}

#[async_trait]
impl RateLimiterBackend for FixedWindowLimiter {
    async fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        FixedWindowLimiter::allow(self, key, limit, window)
    }
}

#[async_trait]
impl DuplicateDetectorBackend for DuplicateDetector {
    async fn seen_recently(&self, key: &str, window: Duration) -> bool {
        DuplicateDetector::seen_recently(self, key, window)
    }
}
