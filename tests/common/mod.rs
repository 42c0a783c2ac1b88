#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notification_relay::{
    AddressRule, ChannelRegistry, ChannelSender, InMemoryKvStore, Keyspace, KvStore, RecipientId,
    RecipientResolver, ResolveError, SendError, StoreError, Subscription, SubscriptionStore,
    MESSAGE_PREFIX,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub channel: String,
    pub address: String,
    pub subject: String,
    pub body: String,
}

/// Sender that records every send instead of delivering it.
pub struct RecordingSender {
    channel: String,
    rule: AddressRule,
    log: Arc<Mutex<Vec<Sent>>>,
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<(), SendError> {
        self.log.lock().unwrap().push(Sent {
            channel: self.channel.clone(),
            address: address.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    fn validate(&self, address: &str) -> bool {
        self.rule.matches(address)
    }

    fn validation_rule(&self) -> &str {
        self.rule.pattern()
    }
}

/// Shared log of sends across all recording channels.
#[derive(Clone, Default)]
pub struct Outbox {
    log: Arc<Mutex<Vec<Sent>>>,
}

impl Outbox {
    pub fn sender(&self, channel: &str, rule: AddressRule) -> Arc<dyn ChannelSender> {
        Arc::new(RecordingSender {
            channel: channel.to_string(),
            rule,
            log: self.log.clone(),
        })
    }

    /// `email` and `sms` channels recording into this outbox.
    pub fn channels(&self) -> ChannelRegistry {
        ChannelRegistry::new()
            .with("email", self.sender("email", AddressRule::email()))
            .with("sms", self.sender("sms", AddressRule::e164()))
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.log.lock().unwrap().clone()
    }
}

/// Resolver that always fails.
pub struct BrokenResolver;

#[async_trait]
impl RecipientResolver for BrokenResolver {
    async fn resolve(&self, _scope: &str, group: &str) -> Result<Vec<String>, ResolveError> {
        Err(ResolveError::UnknownGroup { group: group.to_string() })
    }
}

/// In-memory store whose message ledger reads or writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryKvStore,
    fail_ledger_get: AtomicBool,
    fail_ledger_set: AtomicBool,
}

impl FlakyStore {
    pub fn failing_get() -> Self {
        let store = Self::default();
        store.fail_ledger_get.store(true, Ordering::SeqCst);
        store
    }

    pub fn failing_set() -> Self {
        let store = Self::default();
        store.fail_ledger_set.store(true, Ordering::SeqCst);
        store
    }

    pub fn inner(&self) -> &InMemoryKvStore {
        &self.inner
    }

    fn check(&self, flag: &AtomicBool, key: &str) -> Result<(), StoreError> {
        if key.starts_with(MESSAGE_PREFIX) && flag.load(Ordering::SeqCst) {
            let down = std::io::Error::new(std::io::ErrorKind::Other, "store down");
            return Err(StoreError::backend(key, down));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check(&self.fail_ledger_get, key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check(&self.fail_ledger_set, key)?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.keys(prefix).await
    }

    async fn key_count(&self) -> Result<u64, StoreError> {
        self.inner.key_count().await
    }

    async fn incr_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        self.inner.incr_field(key, field, by).await
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner.fields(key).await
    }
}

pub fn recipient(id: &str) -> RecipientId {
    RecipientId::parse(id).unwrap()
}

pub async fn seed_subscription(store: &Arc<InMemoryKvStore>, keys: &Keyspace, id: &str, subscription: Subscription) {
    let kv: Arc<dyn KvStore> = store.clone();
    SubscriptionStore::new(kv, keys.clone())
        .save(&recipient(id), &subscription)
        .await
        .unwrap();
}
