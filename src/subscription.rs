use std::sync::Arc;

use crate::error::StoreError;
use crate::keyspace::Keyspace;
use crate::storage::KvStore;
use crate::types::{RecipientId, Subscription};

/// Subscription records persisted in the key-value store.
#[derive(Clone)]
pub struct SubscriptionStore {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
}

impl SubscriptionStore {
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keys
    }

    /// The stored subscription, `None` if absent.
    ///
    /// Undecodable records are a decode error; callers on the dispatch path
    /// treat that the same as absent.
    pub async fn load(&self, recipient: &RecipientId) -> Result<Option<Subscription>, StoreError> {
        let key = self.keys.subscription_key(recipient);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Overwrite the whole record. Subscriptions never expire.
    pub async fn save(&self, recipient: &RecipientId, subscription: &Subscription) -> Result<(), StoreError> {
        let key = self.keys.subscription_key(recipient);
        let raw = serde_json::to_string(subscription)?;
        self.store.set(&key, &raw, None).await
    }

    pub async fn delete(&self, recipient: &RecipientId) -> Result<bool, StoreError> {
        self.store.delete(&self.keys.subscription_key(recipient)).await
    }

    /// Every recipient with a stored record, sorted.
    pub async fn recipients(&self) -> Result<Vec<RecipientId>, StoreError> {
        let keys = self.store.keys(self.keys.subscription_prefix()).await?;
        let mut recipients: Vec<RecipientId> = keys
            .iter()
            .filter_map(|key| self.keys.recipient_for_key(key))
            .collect();
        recipients.sort();
        Ok(recipients)
    }
}
