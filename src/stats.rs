use std::sync::Arc;

use crate::error::StoreError;
use crate::keyspace::{Keyspace, COUNTERS_KEY, MESSAGE_PREFIX};
use crate::storage::KvStore;
use crate::types::Stats;

/// Derives [`Stats`] from the store's key namespace and counters.
///
/// Nothing is cached; every snapshot queries the store again.
#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub async fn snapshot(&self) -> Result<Stats, StoreError> {
        let messages_stored = self.store.keys(MESSAGE_PREFIX).await?.len() as u64;
        let counters = self.store.fields(COUNTERS_KEY).await?;

        let users_subscribed = if self.keys.is_legacy() {
            // Subscriptions share the bare namespace: count by exclusion.
            let total = self.store.key_count().await?;
            let reserved = u64::from(!counters.is_empty());
            total.saturating_sub(messages_stored).saturating_sub(reserved)
        } else {
            self.store.keys(self.keys.subscription_prefix()).await?.len() as u64
        };

        let messages_sent = counters
            .into_iter()
            .map(|(channel, raw)| {
                let count = raw.parse::<i64>().unwrap_or_else(|err| {
                    tracing::warn!(%channel, value = %raw, error = %err, "unparsable counter, reporting zero");
                    0
                });
                (channel, count)
            })
            .collect();

        Ok(Stats {
            messages_stored,
            users_subscribed,
            messages_sent,
        })
    }
}
