//! Shared counter store interface.
//!
//! Abstracts the external counting store so the limiter can run against
//! Redis in production and against in-memory fakes in tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Post-increment state of a shared counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCount {
    /// Counter value after the increment.
    pub count: u64,
    /// Time until the store expires the counter and the window resets.
    pub resets_in: Duration,
}

/// Errors that can occur in a shared counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to reach the store.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command.
    #[error("Query error: {0}")]
    Query(String),
}

/// A remote integer counter with store-managed expiry.
///
/// `increment` must apply the increment and the expiry-set as a single
/// atomic unit, so concurrent requests against the same key never race
/// between them.
#[async_trait]
pub trait SharedCounterStore: Send + Sync {
    /// Atomically increment the counter for `key`, creating it with an
    /// expiry of `window` on first hit. Returns the post-increment count
    /// and the time until the window resets.
    async fn increment(&self, key: &str, window: Duration) -> Result<StoreCount, StoreError>;

    /// Current counter value, `None` if no window is active for `key`.
    async fn current(&self, key: &str) -> Result<Option<u64>, StoreError>;
}
