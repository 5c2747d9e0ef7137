//! Core request limiter: decision algorithm, backend selection, fail-open.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::LimiterConfig;
use crate::error::Result;
use crate::hook::{RequestMeta, ResponseWriter};

use super::backend::SharedCounterStore;
use super::counter::LocalCounters;
use super::redis::RedisCounterStore;

/// Namespace prefix applied to every derived key.
pub const KEY_PREFIX: &str = "ratelimit:";

/// The outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request is admitted.
    Allowed {
        /// Quota remaining in the current window.
        remaining: u64,
    },
    /// The request is rejected.
    Limited {
        /// Time until the window resets.
        retry_after: Duration,
    },
}

impl Decision {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Tracks shared store health for per-call backend selection.
///
/// A store failure marks the store down until the retry cooldown elapses;
/// in between, checks route to the local fallback without a network call.
struct StoreHealth {
    /// Clock milliseconds until which the store is considered down.
    down_until_ms: AtomicU64,
}

impl StoreHealth {
    fn new() -> Self {
        Self {
            down_until_ms: AtomicU64::new(0),
        }
    }

    fn is_up(&self, now_ms: u64) -> bool {
        now_ms >= self.down_until_ms.load(Ordering::Relaxed)
    }

    fn mark_down(&self, now_ms: u64, cooldown: Duration) {
        let until = now_ms.saturating_add(cooldown.as_millis() as u64);
        self.down_until_ms.store(until, Ordering::Relaxed);
    }

    fn mark_up(&self) {
        self.down_until_ms.store(0, Ordering::Relaxed);
    }
}

/// Admits or rejects requests according to a per-key quota over a fixed,
/// reset-on-expiry time window.
///
/// Counting runs against the shared store when one is configured and
/// healthy, and against the in-process fallback otherwise. A store error
/// never blocks a request: the limiter admits it, logs the failure, and
/// marks the store down for the configured cooldown.
pub struct RequestLimiter {
    config: LimiterConfig,
    store: Option<Arc<dyn SharedCounterStore>>,
    local: LocalCounters,
    health: StoreHealth,
    clock: Arc<dyn Clock>,
}

impl RequestLimiter {
    /// Create a limiter using only the in-process counters.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::with_parts(config, None, Arc::new(MonotonicClock::default()))
    }

    /// Create a limiter backed by a shared counter store.
    pub fn with_store(config: LimiterConfig, store: Arc<dyn SharedCounterStore>) -> Result<Self> {
        Self::with_parts(config, Some(store), Arc::new(MonotonicClock::default()))
    }

    /// Create a limiter backed by a Redis counter store at `redis_url`.
    pub async fn connect(config: LimiterConfig, redis_url: &str) -> Result<Self> {
        let store = RedisCounterStore::connect(redis_url).await?;
        Self::with_store(config, Arc::new(store))
    }

    /// Create a limiter from explicit parts. Useful when timing must be
    /// controlled, e.g. in tests.
    pub fn with_parts(
        config: LimiterConfig,
        store: Option<Arc<dyn SharedCounterStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            local: LocalCounters::new(clock.clone()),
            health: StoreHealth::new(),
            config,
            store,
            clock,
        })
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Check the quota for a request, deriving its key from the configured
    /// strategy.
    pub async fn check_request(&self, request: &dyn RequestMeta) -> Decision {
        let key = self.config.key_strategy.derive(request);
        self.check_key(&key).await
    }

    /// Check the quota for an already-derived key.
    pub async fn check_key(&self, key: &str) -> Decision {
        let key = format!("{}{}", KEY_PREFIX, key);
        trace!(key = %key, "Checking rate limit");

        if let Some(store) = &self.store {
            let now_ms = self.clock.now_millis();
            if self.health.is_up(now_ms) {
                match store.increment(&key, self.config.window).await {
                    Ok(outcome) => {
                        self.health.mark_up();
                        return self.decide(&key, outcome.count, outcome.resets_in);
                    }
                    Err(e) => {
                        // Fail open: admit this request without counting it
                        // anywhere, and route to the local fallback until
                        // the cooldown elapses.
                        warn!(key = %key, error = %e, "Shared store failed, admitting request");
                        self.health.mark_down(now_ms, self.config.retry_cooldown);
                        return Decision::Allowed {
                            remaining: self.config.max,
                        };
                    }
                }
            }
            debug!(key = %key, "Shared store marked down, using local counters");
        }

        self.local
            .check_and_increment(&key, self.config.max, self.config.window)
    }

    /// Evaluate a post-increment shared counter against the ceiling.
    fn decide(&self, key: &str, count: u64, resets_in: Duration) -> Decision {
        if count > self.config.max {
            debug!(key = %key, count, limit = self.config.max, "Rate limit exceeded");
            Decision::Limited {
                retry_after: resets_in,
            }
        } else {
            Decision::Allowed {
                remaining: self.config.max - count,
            }
        }
    }

    /// Run the middleware hook: admit the request and continue the
    /// pipeline, or apply the exceeded handler to the response.
    ///
    /// Never returns an error to the host; backend failures are absorbed
    /// inside the check.
    pub async fn handle<Req, Res, F, Fut>(&self, request: &Req, response: &mut Res, proceed: F)
    where
        Req: RequestMeta,
        Res: ResponseWriter,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        match self.check_request(request).await {
            Decision::Allowed { .. } => proceed().await,
            Decision::Limited { retry_after } => {
                (self.config.on_exceeded)(request, response, retry_after)
            }
        }
    }

    /// Current count for a derived key on the active backend, `None` if no
    /// counter exists.
    pub async fn current_count(&self, key: &str) -> Option<u64> {
        let key = format!("{}{}", KEY_PREFIX, key);
        if let Some(store) = &self.store {
            if self.health.is_up(self.clock.now_millis()) {
                if let Ok(count) = store.current(&key).await {
                    return count;
                }
            }
        }
        self.local.current(&key)
    }

    /// Number of keys tracked by the in-process fallback.
    pub fn local_counter_count(&self) -> usize {
        self.local.len()
    }
}
