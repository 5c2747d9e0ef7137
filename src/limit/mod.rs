//! Windowed request limiting: decision core and counting backends.

pub mod backend;
pub mod counter;
pub mod limiter;
pub mod redis;

pub use backend::{SharedCounterStore, StoreCount, StoreError};
pub use counter::LocalCounters;
pub use limiter::{Decision, RequestLimiter, KEY_PREFIX};
pub use redis::RedisCounterStore;
