//! In-process fallback counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::clock::Clock;

use super::limiter::Decision;

/// How many windows elapse between sweeps of stale entries.
const SWEEP_INTERVAL_WINDOWS: u64 = 4;

/// Counter state for a single key.
#[derive(Debug, Clone, Copy)]
pub struct CounterEntry {
    /// Requests admitted in the current window.
    pub count: u64,
    /// When the current window started, in clock milliseconds.
    pub window_start_ms: u64,
}

/// Per-key fixed-window counters held in process memory.
///
/// Scoped to the limiter instance that owns it. Entries whose window has
/// expired are swept periodically so the map stays bounded.
pub struct LocalCounters {
    /// Counter entries indexed by derived key.
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    /// Clock milliseconds of the last sweep.
    last_sweep_ms: AtomicU64,
}

impl LocalCounters {
    /// Create an empty counter map.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Admit or reject one request for `key` under `max` per `window`.
    ///
    /// The check and increment run under the per-key map guard, so the
    /// local quota is exact: a rejected request does not increment.
    pub fn check_and_increment(&self, key: &str, max: u64, window: Duration) -> Decision {
        let now_ms = self.clock.now_millis();
        let window_ms = window.as_millis() as u64;
        self.maybe_sweep(now_ms, window_ms);

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            trace!(key = %key, "Creating local counter");
            CounterEntry {
                count: 0,
                window_start_ms: now_ms,
            }
        });

        // Window rollover.
        if now_ms.saturating_sub(entry.window_start_ms) > window_ms {
            entry.count = 0;
            entry.window_start_ms = now_ms;
        }

        if entry.count >= max {
            let elapsed = now_ms.saturating_sub(entry.window_start_ms);
            debug!(key = %key, count = entry.count, limit = max, "Local rate limit exceeded");
            return Decision::Limited {
                retry_after: Duration::from_millis(window_ms.saturating_sub(elapsed)),
            };
        }

        entry.count += 1;
        Decision::Allowed {
            remaining: max - entry.count,
        }
    }

    /// Current count for `key`, `None` if no counter exists.
    pub fn current(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.count)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove entries whose window has expired, at most once every few
    /// windows.
    fn maybe_sweep(&self, now_ms: u64, window_ms: u64) {
        let interval = window_ms.saturating_mul(SWEEP_INTERVAL_WINDOWS).max(1);
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < interval {
            return;
        }
        // Only one caller sweeps per interval.
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now_ms.saturating_sub(entry.window_start_ms) <= window_ms);
        debug!(
            swept = before.saturating_sub(self.entries.len()),
            remaining = self.entries.len(),
            "Swept stale local counters"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn counters() -> (Arc<ManualClock>, LocalCounters) {
        let clock = Arc::new(ManualClock::new());
        let counters = LocalCounters::new(clock.clone());
        (clock, counters)
    }

    #[test]
    fn test_increment_within_limit() {
        let (_clock, counters) = counters();
        let window = Duration::from_secs(60);

        let decision = counters.check_and_increment("k", 10, window);
        assert_eq!(decision, Decision::Allowed { remaining: 9 });
        assert_eq!(counters.current("k"), Some(1));
    }

    #[test]
    fn test_rejection_does_not_increment() {
        let (_clock, counters) = counters();
        let window = Duration::from_secs(60);

        for _ in 0..5 {
            assert!(counters.check_and_increment("k", 5, window).is_allowed());
        }

        let decision = counters.check_and_increment("k", 5, window);
        assert!(!decision.is_allowed());
        assert_eq!(counters.current("k"), Some(5));
    }

    #[test]
    fn test_window_rollover() {
        let (clock, counters) = counters();
        let window = Duration::from_millis(1000);

        assert!(counters.check_and_increment("k", 1, window).is_allowed());
        assert!(!counters.check_and_increment("k", 1, window).is_allowed());

        clock.set(1001);
        let decision = counters.check_and_increment("k", 1, window);
        assert_eq!(decision, Decision::Allowed { remaining: 0 });
        assert_eq!(counters.current("k"), Some(1));
    }

    #[test]
    fn test_distinct_keys_are_isolated() {
        let (_clock, counters) = counters();
        let window = Duration::from_secs(60);

        assert!(counters.check_and_increment("a", 1, window).is_allowed());
        assert!(!counters.check_and_increment("a", 1, window).is_allowed());

        // Key "a" being exhausted has no effect on key "b".
        assert!(counters.check_and_increment("b", 1, window).is_allowed());
    }

    #[test]
    fn test_limited_reports_time_until_reset() {
        let (clock, counters) = counters();
        let window = Duration::from_millis(1000);

        assert!(counters.check_and_increment("k", 1, window).is_allowed());
        clock.set(300);

        let decision = counters.check_and_increment("k", 1, window);
        assert_eq!(
            decision,
            Decision::Limited {
                retry_after: Duration::from_millis(700)
            }
        );
    }

    #[test]
    fn test_sweep_removes_stale_entries() {
        let (clock, counters) = counters();
        let window = Duration::from_millis(1000);

        counters.check_and_increment("old-1", 10, window);
        counters.check_and_increment("old-2", 10, window);
        assert_eq!(counters.len(), 2);

        // Past the sweep interval, both stale entries are dropped when a
        // fresh key comes in.
        clock.set(5000);
        counters.check_and_increment("fresh", 10, window);
        assert_eq!(counters.len(), 1);
        assert_eq!(counters.current("fresh"), Some(1));
    }

    #[test]
    fn test_clear() {
        let (_clock, counters) = counters();
        counters.check_and_increment("k", 10, Duration::from_secs(60));
        assert!(!counters.is_empty());

        counters.clear();
        assert!(counters.is_empty());
    }
}
