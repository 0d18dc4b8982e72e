use async_trait::async_trait;
use redis::{
    aio::{ConnectionLike, ConnectionManager},
    AsyncCommands,
};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{
    error::{AppError, Result},
    models::session::SessionRecord,
};

/// Composite key of one session: `<namespace>:session:<user_id>:<session_id>`.
pub fn session_key(namespace: &str, user_id: i64, session_id: i64) -> String {
    format!("{}:session:{}:{}", namespace, user_id, session_id)
}

/// Server-side session state with expiry.
///
/// An expired session and one that never existed are the same `None`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Writes the record and its TTL as one unit.
    async fn put(&self, record: &SessionRecord, ttl: Duration) -> Result<()>;

    async fn get(&self, user_id: i64, session_id: i64) -> Result<Option<SessionRecord>>;

    /// Removes the session. Removing an absent session is not an error.
    async fn delete(&self, user_id: i64, session_id: i64) -> Result<()>;
}

/// Writes every field of the hash and its TTL inside one MULTI/EXEC.
///
/// The EXEC reply carries only the EXPIRE result.
pub fn put_pipeline(key: &str, fields: &[(&'static str, String)], ttl_secs: i64) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .hset_multiple(key, fields)
        .ignore()
        .expire(key, ttl_secs);
    pipe
}

/// `SessionStore` backed by Redis hashes.
#[derive(Clone)]
pub struct RedisSessionStore<C = ConnectionManager> {
    redis: C,
    namespace: String,
    timeout: Duration,
}

impl<C> RedisSessionStore<C> {
    pub fn new(redis: C, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            redis,
            namespace: namespace.into(),
            timeout,
        }
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ServiceUnavailable(format!("Redis {} timed out", op))),
        }
    }
}

#[async_trait]
impl<C> SessionStore for RedisSessionStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn put(&self, record: &SessionRecord, ttl: Duration) -> Result<()> {
        let key = session_key(&self.namespace, record.user_id, record.session_id);
        let fields = record.to_fields();
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let mut redis = self.redis.clone();

        // Runs to completion even if the caller goes away; MULTI/EXEC keeps the
        // hash and its TTL visible together or not at all.
        let write = tokio::spawn(async move {
            let (expire_applied,): (bool,) = put_pipeline(&key, &fields, ttl_secs)
                .query_async(&mut redis)
                .await
                .map_err(AppError::from)?;

            if !expire_applied {
                let _: i64 = redis.del(&key).await.map_err(AppError::from)?;
                return Err(AppError::Internal(
                    "Session TTL was not applied".to_string(),
                ));
            }
            Ok::<(), AppError>(())
        });

        self.bounded("put", async move {
            match write.await {
                Ok(result) => result,
                Err(e) => Err(AppError::Internal(format!("Session write task failed: {}", e))),
            }
        })
        .await
    }

    async fn get(&self, user_id: i64, session_id: i64) -> Result<Option<SessionRecord>> {
        let key = session_key(&self.namespace, user_id, session_id);
        let mut redis = self.redis.clone();

        let fields = self
            .bounded("get", async {
                redis
                    .hgetall::<_, HashMap<String, String>>(&key)
                    .await
                    .map_err(AppError::from)
            })
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        match SessionRecord::from_fields(&fields) {
            Some(record) if record.user_id == user_id && record.session_id == session_id => {
                Ok(Some(record))
            }
            _ => {
                tracing::error!("Corrupt session hash at {}", key);
                Err(AppError::Internal("Corrupt session record".to_string()))
            }
        }
    }

    async fn delete(&self, user_id: i64, session_id: i64) -> Result<()> {
        let key = session_key(&self.namespace, user_id, session_id);
        let mut redis = self.redis.clone();
        self.bounded("delete", async {
            redis
                .del::<_, i64>(&key)
                .await
                .map(|_| ())
                .map_err(AppError::from)
        })
        .await
    }
}

/// In-process `SessionStore`; expiry follows `tokio::time`, so paused-clock
/// tests can advance past a TTL.
#[derive(Default)]
pub struct MemorySessionStore {
    namespace: String,
    entries: RwLock<HashMap<String, (SessionRecord, Instant)>>,
}

impl MemorySessionStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|(_, deadline)| *deadline > now).count()
    }

    /// Drops the raw key, as an operator deleting it from the cache would.
    pub async fn evict(&self, user_id: i64, session_id: i64) {
        let key = session_key(&self.namespace, user_id, session_id);
        self.entries.write().await.remove(&key);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, record: &SessionRecord, ttl: Duration) -> Result<()> {
        let key = session_key(&self.namespace, record.user_id, record.session_id);
        let deadline = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key, (record.clone(), deadline));
        Ok(())
    }

    async fn get(&self, user_id: i64, session_id: i64) -> Result<Option<SessionRecord>> {
        let key = session_key(&self.namespace, user_id, session_id);
        let mut entries = self.entries.write().await;
        match entries.get(&key) {
            Some((record, deadline)) if *deadline > Instant::now() => Ok(Some(record.clone())),
            Some(_) => {
                entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, user_id: i64, session_id: i64) -> Result<()> {
        let key = session_key(&self.namespace, user_id, session_id);
        self.entries.write().await.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::Role;
    use chrono::{TimeZone, Utc};
    use redis::{Cmd, Pipeline, RedisFuture, Value};
    use redis_test::{MockCmd, MockRedisConnection};

    fn record(user_id: i64, session_id: i64) -> SessionRecord {
        SessionRecord {
            user_id,
            session_id,
            username: "alice".into(),
            email: "alice@campus.test".into(),
            name: "Alice".into(),
            role: Role::Student,
            major: None,
            year: None,
            ip: "127.0.0.1".into(),
            user_agent: "test".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn key_scheme_is_namespaced_and_composite() {
        assert_eq!(session_key("ecampus", 12, 34), "ecampus:session:12:34");
        assert_ne!(session_key("ecampus", 1, 23), session_key("ecampus", 12, 3));
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemorySessionStore::new("test");
        let rec = record(1, 2);
        store.put(&rec, Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get(1, 2).await.unwrap(), Some(rec));
        assert_eq!(store.get(2, 2).await.unwrap(), None);
        assert_eq!(store.get(1, 3).await.unwrap(), None);

        store.delete(1, 2).await.unwrap();
        assert_eq!(store.get(1, 2).await.unwrap(), None);
        store.delete(1, 2).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_reads_as_absent() {
        let store = MemorySessionStore::new("test");
        store.put(&record(1, 2), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get(1, 2).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get(1, 2).await.unwrap(), None);
        assert_eq!(store.get(1, 2).await.unwrap(), store.get(9, 9).await.unwrap());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_sessions_per_user_are_independent() {
        let store = MemorySessionStore::new("test");
        store.put(&record(1, 10), Duration::from_secs(60)).await.unwrap();
        store.put(&record(1, 11), Duration::from_secs(60)).await.unwrap();
        store.delete(1, 10).await.unwrap();
        assert!(store.get(1, 11).await.unwrap().is_some());
        assert_eq!(store.len().await, 1);
    }

    /// A connection whose replies never arrive.
    #[derive(Clone)]
    struct StalledConnection;

    impl ConnectionLike for StalledConnection {
        fn req_packed_command<'a>(&'a mut self, _: &'a Cmd) -> RedisFuture<'a, Value> {
            Box::pin(std::future::pending())
        }

        fn req_packed_commands<'a>(
            &'a mut self,
            _: &'a Pipeline,
            _: usize,
            _: usize,
        ) -> RedisFuture<'a, Vec<Value>> {
            Box::pin(std::future::pending())
        }

        fn get_db(&self) -> i64 {
            0
        }
    }

    fn stored(user_id: i64, session_id: i64) -> SessionRecord {
        SessionRecord {
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            major: Some("Physics".into()),
            ..record(user_id, session_id)
        }
    }

    fn hash_reply(record: &SessionRecord) -> Value {
        Value::Array(
            record
                .to_fields()
                .into_iter()
                .flat_map(|(name, value)| {
                    [
                        Value::BulkString(name.as_bytes().to_vec()),
                        Value::BulkString(value.into_bytes()),
                    ]
                })
                .collect(),
        )
    }

    fn expected_put(key: &str, record: &SessionRecord, ttl_secs: i64) -> Pipeline {
        let fields = record.to_fields();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HMSET")
            .arg(key)
            .arg(fields.as_slice())
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs);
        pipe
    }

    fn redis_store(commands: Vec<MockCmd>) -> RedisSessionStore<MockRedisConnection> {
        RedisSessionStore::new(
            MockRedisConnection::new(commands),
            "test",
            Duration::from_secs(1),
        )
    }

    #[test]
    fn put_is_one_transaction_with_expire_last() {
        let rec = stored(1, 2);
        let key = session_key("test", 1, 2);
        let packed = put_pipeline(&key, &rec.to_fields(), 60).get_packed_pipeline();
        let text = String::from_utf8_lossy(&packed);

        let multi = text.find("MULTI").unwrap();
        let hmset = text.find("HMSET").unwrap();
        let expire = text.find("EXPIRE").unwrap();
        let exec = text.find("EXEC").unwrap();
        assert!(multi < hmset && hmset < expire && expire < exec);
        assert!(text.contains(&key));
        assert!(text.contains("user_id"));
        assert!(text.contains("Physics"));
    }

    #[tokio::test]
    async fn redis_put_sends_hash_and_ttl_atomically() {
        let rec = stored(1, 2);
        let key = session_key("test", 1, 2);
        let store = redis_store(vec![MockCmd::with_values(
            expected_put(&key, &rec, 86400),
            Ok(vec![Value::Array(vec![Value::Okay, Value::Int(1)])]),
        )]);

        store.put(&rec, Duration::from_secs(86400)).await.unwrap();
    }

    #[tokio::test]
    async fn redis_put_without_ttl_deletes_the_hash() {
        let rec = stored(1, 2);
        let key = session_key("test", 1, 2);
        let store = redis_store(vec![
            MockCmd::with_values(
                expected_put(&key, &rec, 60),
                Ok(vec![Value::Array(vec![Value::Okay, Value::Int(0)])]),
            ),
            MockCmd::new(redis::cmd("DEL").arg(&key), Ok(Value::Int(1))),
        ]);

        let err = store.put(&rec, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[tokio::test]
    async fn redis_get_decodes_the_hash() {
        let rec = stored(1, 2);
        let key = session_key("test", 1, 2);
        let store = redis_store(vec![MockCmd::new(
            redis::cmd("HGETALL").arg(&key),
            Ok(hash_reply(&rec)),
        )]);

        assert_eq!(store.get(1, 2).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn redis_get_of_missing_hash_is_none() {
        let key = session_key("test", 1, 2);
        let store = redis_store(vec![MockCmd::new(
            redis::cmd("HGETALL").arg(&key),
            Ok(Value::Array(vec![])),
        )]);

        assert_eq!(store.get(1, 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn redis_get_rejects_hash_of_another_session() {
        let key = session_key("test", 1, 2);
        let store = redis_store(vec![
            MockCmd::new(
                redis::cmd("HGETALL").arg(&key),
                Ok(hash_reply(&stored(1, 3))),
            ),
            MockCmd::new(
                redis::cmd("HGETALL").arg(&key),
                Ok(hash_reply(&stored(7, 2))),
            ),
        ]);

        assert!(matches!(store.get(1, 2).await, Err(AppError::Internal(_))));
        assert!(matches!(store.get(1, 2).await, Err(AppError::Internal(_))));
    }

    #[tokio::test]
    async fn redis_delete_issues_del() {
        let key = session_key("test", 4, 5);
        let store = redis_store(vec![MockCmd::new(
            redis::cmd("DEL").arg(&key),
            Ok(Value::Int(0)),
        )]);

        store.delete(4, 5).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_redis_is_service_unavailable() {
        let store = RedisSessionStore::new(StalledConnection, "test", Duration::from_millis(250));

        assert!(matches!(
            store.get(1, 2).await,
            Err(AppError::ServiceUnavailable(_))
        ));
        assert!(matches!(
            store.put(&stored(1, 2), Duration::from_secs(60)).await,
            Err(AppError::ServiceUnavailable(_))
        ));
        assert!(matches!(
            store.delete(1, 2).await,
            Err(AppError::ServiceUnavailable(_))
        ));
    }
}
