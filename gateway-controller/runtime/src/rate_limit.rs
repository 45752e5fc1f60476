use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::{hash::Hash, sync::Arc, time::Duration};

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff: each failure of a key doubles its delay, up
/// to a cap, until the key is forgotten.
#[derive(Clone, Debug)]
pub struct RateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Arc<Mutex<HashMap<K, u32>>>,
}

// === impl RateLimiter ===

impl<K: Hash + Eq + Clone> RateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Default::default(),
        }
    }

    /// Records a failure of `key` and returns how long to wait before
    /// retrying it.
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let n = failures.entry(key.clone()).or_default();
        let delay = 1u32
            .checked_shl(*n)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max));
        *n = n.saturating_add(1);
        delay
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    pub fn retries(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or_default()
    }
}

impl<K: Hash + Eq + Clone> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::new(BASE_DELAY, MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn doubles_per_failure() {
        let limiter = RateLimiter::default();
        let delays = (0..4).map(|_| limiter.when(&"gw-0")).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [5, 10, 20, 40].map(Duration::from_millis).to_vec()
        );
        assert_eq!(limiter.retries(&"gw-0"), 4);
    }

    #[test]
    fn caps_the_delay() {
        let limiter = RateLimiter::default();
        let last = (0..40).map(|_| limiter.when(&"gw-0")).last();
        assert_eq!(last, Some(MAX_DELAY));
    }

    #[test]
    fn forgetting_resets_the_key() {
        let limiter = RateLimiter::default();
        limiter.when(&"gw-0");
        limiter.when(&"gw-0");
        assert_eq!(limiter.when(&"gw-1"), BASE_DELAY);

        limiter.forget(&"gw-0");
        assert_eq!(limiter.retries(&"gw-0"), 0);
        assert_eq!(limiter.when(&"gw-0"), BASE_DELAY);
    }
}
