//! Local fixed-window rate limiter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Counter state for a single key.
#[derive(Debug, Clone, Copy)]
struct WindowRecord {
    window_start: Instant,
    count: u32,
}

/// An in-process fixed-window rate limiter keyed by arbitrary strings.
///
/// Windows are hard-edged: the counter resets once a full window has elapsed
/// since the window start, so a client can burst up to twice the limit across
/// a window boundary. That trade-off is accepted in exchange for constant-size
/// per-key state.
///
/// Expired keys are swept opportunistically whenever a window resets; there is
/// no background timer.
pub struct FixedWindowLimiter {
    records: Mutex<HashMap<String, WindowRecord>>,
}

impl FixedWindowLimiter {
    /// Create a new limiter with no tracked keys.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit for `key` and report whether it stays within `limit`
    /// for the current window.
    ///
    /// A `limit` of zero always denies.
    pub fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        if limit == 0 {
            return false;
        }

        let now = Instant::now();
        let mut records = self.records.lock();

        match records.get_mut(key) {
            Some(record) if now.duration_since(record.window_start) < window => {
                if record.count >= limit {
                    debug!(key = %key, limit = limit, "Rate limit exceeded");
                    return false;
                }
                record.count += 1;
                true
            }
            _ => {
                records.insert(
                    key.to_string(),
                    WindowRecord {
                        window_start: now,
                        count: 1,
                    },
                );
                Self::sweep_expired(&mut records, now, window);
                true
            }
        }
    }

    /// Drop keys whose window start is more than two windows old.
    fn sweep_expired(records: &mut HashMap<String, WindowRecord>, now: Instant, window: Duration) {
        records.retain(|_, record| now.duration_since(record.window_start) < window * 2);
    }

    /// Number of tracked keys, for tests and introspection.
    pub fn tracked_keys(&self) -> usize {
        self.records.lock().len()
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}
