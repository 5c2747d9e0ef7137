//! Redis-backed shared counter store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;

use super::backend::{SharedCounterStore, StoreCount, StoreError};

/// Atomically increments a window counter, creating it with an expiry on
/// the first hit. The expiry is only set at creation, so requests past the
/// ceiling never extend the window. Runs as a single unit on the server.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return {count, redis.call('PTTL', KEYS[1])}
"#;

/// Shared counter store backed by Redis.
///
/// Uses a multiplexed connection manager, so the store can be shared
/// cheaply across tasks.
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: Script,
}

impl RedisCounterStore {
    /// Connect to Redis and verify the connection with a ping.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let mut connection = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        debug!(url = %url, "Connected to Redis counter store");

        Ok(Self {
            connection,
            script: Script::new(INCREMENT_SCRIPT),
        })
    }
}

#[async_trait]
impl SharedCounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<StoreCount, StoreError> {
        let mut connection = self.connection.clone();

        let (count, pttl_ms): (u64, i64) = self
            .script
            .key(key)
            .arg(window_millis(window))
            .invoke_async(&mut connection)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        // PTTL is negative when the key carries no expiry; treat that as a
        // freshly opened window.
        let resets_in = if pttl_ms > 0 {
            Duration::from_millis(pttl_ms as u64)
        } else {
            window
        };

        Ok(StoreCount { count, resets_in })
    }

    async fn current(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut connection = self.connection.clone();
        let count: Option<u64> = connection
            .get(key)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(count)
    }
}

/// Window length in whole milliseconds, never below one.
fn window_millis(window: Duration) -> u64 {
    (window.as_millis() as u64).max(1)
}
