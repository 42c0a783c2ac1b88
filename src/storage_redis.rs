use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::StoreError;
use crate::storage::KvStore;

/// Redis-backed store.
///
/// Keys are used verbatim so the layout stays readable with `redis-cli`.
pub struct RedisKvStore {
    client: redis::Client,
}

impl RedisKvStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::backend("open redis client", e))?;
        Ok(Self::new(client))
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(|e| StoreError::backend("connect to redis", e))
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get(key)
            .await
            .map_err(|e| StoreError::backend(format!("GET {key}"), e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::backend(format!("SET {key}"), e))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| StoreError::backend(format!("DEL {key}"), e))?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", escape_glob(prefix));
        let mut iter = conn
            .scan_match::<_, String>(&pattern)
            .await
            .map_err(|e| StoreError::backend(format!("SCAN {pattern}"), e))?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn key_count(&self) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::backend("DBSIZE", e))
    }

    async fn incr_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        conn.hincr(key, field, by)
            .await
            .map_err(|e| StoreError::backend(format!("HINCRBY {key} {field}"), e))
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.connection().await?;
        conn.hgetall(key)
            .await
            .map_err(|e| StoreError::backend(format!("HGETALL {key}"), e))
    }
}

// SCAN MATCH treats these as glob syntax.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
