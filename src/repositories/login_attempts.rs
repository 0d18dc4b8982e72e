use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{AppError, Result};

/// Failed-login counters keyed by login name, each living for one window.
#[async_trait]
pub trait LoginAttempts: Send + Sync {
    /// Current failures for `login` and seconds until the window closes.
    async fn failures(&self, login: &str) -> Result<(u64, u64)>;

    /// Counts one failure; the first failure opens the window.
    async fn record_failure(&self, login: &str, window: Duration) -> Result<()>;

    async fn reset(&self, login: &str) -> Result<()>;
}

/// Counters stored as Redis integers under `<namespace>:rate_limit:login:<login>`.
#[derive(Clone)]
pub struct RedisLoginAttempts<C = ConnectionManager> {
    redis: C,
    namespace: String,
    timeout: Duration,
}

impl<C> RedisLoginAttempts<C> {
    pub fn new(redis: C, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            redis,
            namespace: namespace.into(),
            timeout,
        }
    }

    fn key(&self, login: &str) -> String {
        format!("{}:rate_limit:login:{}", self.namespace, login.to_lowercase())
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(AppError::ServiceUnavailable(
                "Redis rate limit lookup timed out".to_string(),
            )),
        }
    }
}

#[async_trait]
impl<C> LoginAttempts for RedisLoginAttempts<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn failures(&self, login: &str) -> Result<(u64, u64)> {
        let key = self.key(login);
        let mut redis = self.redis.clone();
        let (count, ttl): (Option<u64>, i64) = self
            .bounded(
                redis::pipe()
                    .cmd("GET")
                    .arg(&key)
                    .cmd("TTL")
                    .arg(&key)
                    .query_async(&mut redis),
            )
            .await?;
        Ok((count.unwrap_or(0), ttl.max(0) as u64))
    }

    async fn record_failure(&self, login: &str, window: Duration) -> Result<()> {
        let key = self.key(login);
        let mut redis = self.redis.clone();
        // SET NX opens the window only on the first failure; INCR keeps the TTL.
        let _: (Option<String>, i64) = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(&key)
                    .arg(0)
                    .arg("EX")
                    .arg(window.as_secs().max(1))
                    .arg("NX")
                    .cmd("INCR")
                    .arg(&key)
                    .query_async(&mut redis),
            )
            .await?;
        Ok(())
    }

    async fn reset(&self, login: &str) -> Result<()> {
        let key = self.key(login);
        let mut redis = self.redis.clone();
        let _: i64 = self
            .bounded(redis::cmd("DEL").arg(&key).query_async(&mut redis))
            .await?;
        Ok(())
    }
}

/// In-process counters for tests and single-node runs.
#[derive(Default)]
pub struct MemoryLoginAttempts {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryLoginAttempts {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoginAttempts for MemoryLoginAttempts {
    async fn failures(&self, login: &str) -> Result<(u64, u64)> {
        let now = Instant::now();
        let counters = self.counters.lock().await;
        Ok(match counters.get(&login.to_lowercase()) {
            Some((count, deadline)) if *deadline > now => {
                (*count, deadline.duration_since(now).as_secs())
            }
            _ => (0, 0),
        })
    }

    async fn record_failure(&self, login: &str, window: Duration) -> Result<()> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let entry = counters
            .entry(login.to_lowercase())
            .or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(())
    }

    async fn reset(&self, login: &str) -> Result<()> {
        self.counters.lock().await.remove(&login.to_lowercase());
        Ok(())
    }
}
