//! Enhanced DB Client (§4.10): connection pool, query-duration monitoring
//! with slow-query flagging, and a two-tier (in-process + Redis) cache for
//! cacheable reads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct QueryStats {
    pub duration: Duration,
    pub rows: u64,
    pub slow: bool,
}

#[derive(Debug, Clone)]
pub struct PoolHealth {
    pub active: u32,
    pub idle: u32,
    pub max: u32,
    pub healthy: bool,
}

struct L1Entry {
    value: String,
    expires_at: Instant,
}

/// Wraps a [`PgPool`] with the monitoring and caching behavior every query
/// in this crate goes through, rather than reaching for `sqlx` directly.
pub struct DbClient {
    pool: PgPool,
    redis: Option<ConnectionManager>,
    l1: DashMap<String, L1Entry>,
    slow_query_threshold: Duration,
    default_cache_ttl: Duration,
}

impl DbClient {
    pub async fn connect(config: &DatabaseConfig, redis: Option<ConnectionManager>, default_cache_ttl: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .idle_timeout(Duration::from_millis(config.idle_timeout_ms))
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            redis,
            l1: DashMap::new(),
            slow_query_threshold: Duration::from_millis(config.slow_query_ms),
            default_cache_ttl,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `query_fn` against the pool, timing it and flagging it as slow
    /// when it exceeds `slow_query_ms`. Callers pass their own fetch closure
    /// so this wrapper stays agnostic to the query shape.
    pub async fn monitored<F, Fut, T>(&self, query_name: &str, query_fn: F) -> Result<(T, QueryStats)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(T, u64)>>,
    {
        let started = Instant::now();
        let (value, rows) = query_fn().await?;
        let duration = started.elapsed();
        let slow = duration >= self.slow_query_threshold;

        if slow {
            tracing::warn!(query = query_name, duration_ms = duration.as_millis() as u64, rows, "slow query detected");
        } else {
            tracing::debug!(query = query_name, duration_ms = duration.as_millis() as u64, rows, "query completed");
        }

        Ok((value, QueryStats { duration, rows, slow }))
    }

    /// Deterministic cache key for a `(queryName, params)` pair, per §4.10.
    pub fn cache_key(query_name: &str, params: &impl Serialize) -> String {
        let params_json = serde_json::to_string(params).unwrap_or_default();
        let mut hasher = sha2::Sha256::new_with_prefix(params_json.as_bytes());
        use sha2::Digest;
        hasher.update(query_name.as_bytes());
        format!("dbcache:{}:{}", query_name, hex::encode(hasher.finalize()))
    }

    /// Reads through L1 (in-process) then L2 (Redis); populates both on an
    /// L2 hit so the next call on this process skips the network round trip.
    pub async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(entry) = self.l1.get(key) {
            if entry.expires_at > Instant::now() {
                return serde_json::from_str(&entry.value).ok();
            }
        }
        self.l1.remove(key);

        let mut redis = self.redis.clone()?;
        let raw: Option<String> = redis.get(key).await.ok().flatten();
        if let Some(raw) = &raw {
            self.l1.insert(
                key.to_string(),
                L1Entry {
                    value: raw.clone(),
                    expires_at: Instant::now() + self.default_cache_ttl,
                },
            );
        }
        raw.and_then(|raw| serde_json::from_str(&raw).ok())
    }

    pub async fn cache_set(&self, key: &str, value: &impl Serialize, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.default_cache_ttl);
        let serialized = serde_json::to_string(value)?;

        self.l1.insert(
            key.to_string(),
            L1Entry {
                value: serialized.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        if let Some(mut redis) = self.redis.clone() {
            let _: () = redis.set_ex(key, serialized, ttl.as_secs().max(1)).await?;
        }
        Ok(())
    }

    /// Invalidates a cache entry in both tiers, called after any write that
    /// touches the rows a cached read covers.
    pub async fn cache_invalidate(&self, key: &str) -> Result<()> {
        self.l1.remove(key);
        if let Some(mut redis) = self.redis.clone() {
            let _: () = redis.del(key).await?;
        }
        Ok(())
    }

    pub fn health(&self) -> PoolHealth {
        let active = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolHealth {
            active,
            idle,
            max: self.pool.options().get_max_connections(),
            healthy: active > 0 || idle > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_key_is_deterministic_for_same_params() {
        let a = DbClient::cache_key("find_events", &json!({"orgId": "org-1", "limit": 10}));
        let b = DbClient::cache_key("find_events", &json!({"orgId": "org-1", "limit": 10}));
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_differs_for_different_query_names() {
        let a = DbClient::cache_key("find_events", &json!({"orgId": "org-1"}));
        let b = DbClient::cache_key("count_events", &json!({"orgId": "org-1"}));
        assert_ne!(a, b);
    }
}
