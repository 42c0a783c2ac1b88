use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;

/// Key-value store the relay persists into.
///
/// Treated as a remote service: implementations must make `incr_field`
/// atomic, everything else may be a plain round-trip.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key`; `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All live keys starting with `prefix` (empty prefix = every key).
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Number of live keys.
    async fn key_count(&self) -> Result<u64, StoreError>;

    /// Atomically add `by` to a hash field and return the new value.
    async fn incr_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError>;

    /// Every field of a hash; empty when the key does not exist.
    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
}

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory store for tests and single-process deployments.
///
/// Expiry is evaluated lazily against the tokio clock.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>) {
    let now = Instant::now();
    entries.retain(|_, entry| entry.is_live(now));
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries);
        match entries.get(key).map(|e| &e.slot) {
            None => Ok(None),
            Some(Slot::Text(value)) => Ok(Some(value.clone())),
            Some(Slot::Hash(_)) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries);
        Ok(entries.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries);
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn key_count(&self) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries);
        Ok(entries.len() as u64)
    }

    async fn incr_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Hash(HashMap::new()),
            expires_at: None,
        });

        let Slot::Hash(fields) = &mut entry.slot else {
            return Err(StoreError::WrongType { key: key.to_string() });
        };

        let current = match fields.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| StoreError::WrongType { key: format!("{key}.{field}") })?,
            None => 0,
        };
        let next = current + by;
        fields.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries);
        match entries.get(key).map(|e| &e.slot) {
            None => Ok(HashMap::new()),
            Some(Slot::Hash(fields)) => Ok(fields.clone()),
            Some(Slot::Text(_)) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }
}
