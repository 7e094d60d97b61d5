//! Sliding-window hit counters backing the throughput guard.
//!
//! Each hit evicts entries at or before `now - window`, records itself, and returns how many
//! entries remain. [`RedisWindowStore`] does all three in one Lua script; [`InMemoryWindowStore`]
//! is a single-process best-effort fallback.

use crate::store::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait SlidingWindowStore: Send + Sync {
    /// Record a hit at `now_ms` and return the number of hits inside the window, this one included.
    async fn hit(&self, key: &str, now_ms: i64, window: Duration) -> Result<u64, StoreError>;

    fn backend(&self) -> &'static str;
}

/// Per-process window map. Not shared across gateway instances.
#[derive(Default)]
pub struct InMemoryWindowStore {
    state: Mutex<Windows>,
}

#[derive(Default)]
struct Windows {
    hits: HashMap<String, VecDeque<i64>>,
    /// Idle callers are swept at most once per window length.
    next_sweep_ms: i64,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlidingWindowStore for InMemoryWindowStore {
    async fn hit(&self, key: &str, now_ms: i64, window: Duration) -> Result<u64, StoreError> {
        let window_ms = window.as_millis() as i64;
        let cutoff = now_ms - window_ms;
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;

        if now_ms >= state.next_sweep_ms {
            state
                .hits
                .retain(|k, entries| k == key || entries.back().is_some_and(|&last| last > cutoff));
            state.next_sweep_ms = now_ms.saturating_add(window_ms);
        }

        let entries = state.hits.entry(key.to_string()).or_default();
        while entries.front().is_some_and(|&ts| ts <= cutoff) {
            entries.pop_front();
        }
        entries.push_back(now_ms);
        Ok(entries.len() as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local cutoff = tonumber(ARGV[1])
local now_ms = tonumber(ARGV[2])
local member = ARGV[3]
local ttl_ms = tonumber(ARGV[4])

redis.call("ZREMRANGEBYSCORE", key, "-inf", cutoff)
redis.call("ZADD", key, now_ms, member)
local count = redis.call("ZCARD", key)
redis.call("PEXPIRE", key, ttl_ms)
return count
"#;

/// Redis sorted-set window, one key per caller.
pub struct RedisWindowStore {
    client: redis::Client,
    prefix: String,
}

impl RedisWindowStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "tollgate".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn key(&self, caller_key: &str) -> String {
        format!("{}:ratelimit:{}", self.prefix, caller_key)
    }
}

#[async_trait]
impl SlidingWindowStore for RedisWindowStore {
    async fn hit(&self, key: &str, now_ms: i64, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let window_ms = window.as_millis() as i64;
        // Two hits in the same millisecond must stay distinct members.
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let count: u64 = redis::Script::new(SLIDING_WINDOW_SCRIPT)
            .key(self.key(key))
            .arg(now_ms - window_ms)
            .arg(now_ms)
            .arg(member)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
