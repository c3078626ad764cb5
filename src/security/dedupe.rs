//! Duplicate-submission detection over a TTL window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// An in-process "seen recently" set keyed by content fingerprint.
///
/// An entry's expiry is fixed when it is first recorded; repeated sightings
/// inside the window do not extend it. Expired entries are swept on every
/// call rather than by a background task.
pub struct DuplicateDetector {
    records: Mutex<HashMap<String, Instant>>,
}

impl DuplicateDetector {
    /// Create a new detector with no recorded fingerprints.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Report whether `key` was observed within the last `window`.
    ///
    /// On a miss the key is recorded with an expiry of `now + window` and
    /// `false` is returned.
    pub fn seen_recently(&self, key: &str, window: Duration) -> bool {
        let now = Instant::now();
        let mut records = self.records.lock();

        if let Some(expires_at) = records.get(key) {
            if now < *expires_at {
                return true;
            }
        }

        records.insert(key.to_string(), now + window);
        records.retain(|_, expires_at| now < *expires_at);

        false
    }

    /// Number of tracked fingerprints, for tests and introspection.
    pub fn tracked_keys(&self) -> usize {
        self.records.lock().len()
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_a_miss_repeat_is_a_hit() {
        let detector = DuplicateDetector::new();
        let window = Duration::from_secs(600);

        assert!(!detector.seen_recently("fingerprint", window));
        assert!(detector.seen_recently("fingerprint", window));
    }

    #[test]
    fn entry_expires_after_window() {
        let detector = DuplicateDetector::new();
        let window = Duration::from_millis(30);

        assert!(!detector.seen_recently("fingerprint", window));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!detector.seen_recently("fingerprint", window));
    }

    #[test]
    fn hits_do_not_extend_expiry() {
        let detector = DuplicateDetector::new();
        let window = Duration::from_millis(60);

        assert!(!detector.seen_recently("fingerprint", window));
        std::thread::sleep(Duration::from_millis(35));
        // Still inside the original window.
        assert!(detector.seen_recently("fingerprint", window));
        std::thread::sleep(Duration::from_millis(35));
        // Past the original expiry even though the key was touched above.
        assert!(!detector.seen_recently("fingerprint", window));
    }

    #[test]
    fn expired_entries_are_swept() {
        let detector = DuplicateDetector::new();
        let window = Duration::from_millis(20);

        assert!(!detector.seen_recently("a", window));
        assert!(!detector.seen_recently("b", window));
        std::thread::sleep(Duration::from_millis(30));

        assert!(!detector.seen_recently("c", window));
        assert_eq!(detector.tracked_keys(), 1);
    }
}
