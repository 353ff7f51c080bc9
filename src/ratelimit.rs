// src/ratelimit.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{error, warn};

use crate::StoreError;

/// Result of recording (or refusing) one request in a window.
#[derive(Debug, Clone, Copy)]
pub struct WindowSample {
    pub allowed: bool,
    /// Requests counted inside the window, including this one when allowed.
    pub count: u64,
    /// Time until the window state expires.
    pub reset_after: Duration,
}

/// Sorted-set shaped sliding-window state, keyed by caller identity and
/// route. Mutations on a single key are atomic per backend.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Evicts members older than the window, counts what remains, and either
    /// records `member` (refreshing the key TTL) or refuses.
    async fn hit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        max_requests: u32,
        member: &str,
    ) -> Result<WindowSample, StoreError>;

    /// Removes a previously recorded member (skip-successful mode).
    async fn forget(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Default key scheme: per client IP and route.
pub fn ip_route_key(ip: &str, route: &str) -> String {
    format!("rate_limit:{}:{}", ip, route)
}

/// Authenticated scope.
pub fn user_route_key(user_id: &str, route: &str) -> String {
    format!("rate_limit:user:{}:{}", user_id, route)
}

fn kv_error(err: redis::RedisError) -> StoreError {
    StoreError::Storage(err.to_string())
}

pub struct RedisWindowStore {
    conn: ConnectionManager,
}

impl RedisWindowStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        max_requests: u32,
        member: &str,
    ) -> Result<WindowSample, StoreError> {
        let mut conn = self.conn.clone();
        let now_ms = now.timestamp_millis();
        let window_ms = window.as_millis() as i64;
        let window_start = now_ms - window_ms;

        // Exclusive upper bound: a member scored exactly at the window edge
        // still counts.
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", window_start))
            .ignore()
            .zcard(key)
            .query_async(&mut conn)
            .await
            .map_err(kv_error)?;

        if count >= max_requests as u64 {
            let ttl_ms: i64 = conn.pttl(key).await.map_err(kv_error)?;
            let reset_after = if ttl_ms > 0 {
                Duration::from_millis(ttl_ms as u64)
            } else {
                window
            };
            return Ok(WindowSample {
                allowed: false,
                count,
                reset_after,
            });
        }

        let _: () = redis::pipe()
            .atomic()
            .zadd(key, member, now_ms)
            .ignore()
            .expire(key, (window_ms + 999) / 1000)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(kv_error)?;

        Ok(WindowSample {
            allowed: true,
            count: count + 1,
            reset_after: window,
        })
    }

    async fn forget(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(key, member).await.map_err(kv_error)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(kv_error)?;
        Ok(())
    }
}

/// In-process window store for tests and single-node development.
#[derive(Clone, Default)]
pub struct MemoryWindowStore {
    windows: Arc<Mutex<HashMap<String, Vec<(i64, String)>>>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        max_requests: u32,
        member: &str,
    ) -> Result<WindowSample, StoreError> {
        let mut windows = self.windows.lock().unwrap();
        let entries = windows.entry(key.to_string()).or_default();

        let now_ms = now.timestamp_millis();
        let window_ms = window.as_millis() as i64;
        let window_start = now_ms - window_ms;
        entries.retain(|(at, _)| *at >= window_start);

        let count = entries.len() as u64;
        if count >= max_requests as u64 {
            // Matches the Redis key TTL: the window resets when the newest
            // member ages out.
            let newest = entries.iter().map(|(at, _)| *at).max().unwrap_or(now_ms);
            let reset_after =
                Duration::from_millis((newest + window_ms - now_ms).max(0) as u64);
            return Ok(WindowSample {
                allowed: false,
                count,
                reset_after,
            });
        }

        entries.push((now_ms, member.to_string()));
        Ok(WindowSample {
            allowed: true,
            count: count + 1,
            reset_after: window,
        })
    }

    async fn forget(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut windows = self.windows.lock().unwrap();
        if let Some(entries) = windows.get_mut(key) {
            entries.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
    /// Refuse traffic when the KV store is unreachable instead of letting it
    /// through. Default is fail-open.
    pub fail_closed: bool,
    /// Un-count requests whose downstream response was below 400.
    pub skip_successful: bool,
}

/// Limiter verdict plus everything the edge needs for `X-RateLimit-*`.
#[derive(Debug, Clone, Copy)]
pub enum RateDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after: Duration,
    },
    Limited {
        limit: u32,
        retry_after: Duration,
        reset_after: Duration,
    },
}

pub struct SlidingWindowLimiter {
    store: Arc<dyn WindowStore>,
    config: RateLimitConfig,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn WindowStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn check(&self, key: &str, member: &str) -> RateDecision {
        let limit = self.config.max_requests;

        match self
            .store
            .hit(key, Utc::now(), self.config.window, limit, member)
            .await
        {
            Ok(sample) if sample.allowed => RateDecision::Allowed {
                limit,
                remaining: (limit as u64).saturating_sub(sample.count) as u32,
                reset_after: sample.reset_after,
            },
            Ok(sample) => {
                counter!("cardless_rate_limited_total").increment(1);
                warn!(
                    event_type = "SECURITY",
                    component = "ratelimit",
                    key,
                    count = sample.count,
                    "rate limit exceeded"
                );
                RateDecision::Limited {
                    limit,
                    retry_after: sample.reset_after,
                    reset_after: sample.reset_after,
                }
            }
            Err(err) => {
                error!(
                    event_type = "SECURITY",
                    component = "ratelimit",
                    error = %err,
                    fail_closed = self.config.fail_closed,
                    "rate limit backend unreachable"
                );
                if self.config.fail_closed {
                    RateDecision::Limited {
                        limit,
                        retry_after: self.config.window,
                        reset_after: self.config.window,
                    }
                } else {
                    RateDecision::Allowed {
                        limit,
                        remaining: limit,
                        reset_after: self.config.window,
                    }
                }
            }
        }
    }

    /// Skip-successful mode: drop the member recorded for a request whose
    /// response turned out to be below 400.
    pub async fn release(&self, key: &str, member: &str) {
        if let Err(err) = self.store.forget(key, member).await {
            warn!(
                event_type = "SYSTEM",
                component = "ratelimit",
                error = %err,
                "failed to release rate limit member"
            );
        }
    }
}
