use std::sync::Arc;

use serde::Serialize;

use crate::auth::{ApiUsers, Credentials, SessionIdentity};
use crate::channel::ChannelRegistry;
use crate::config::{ConfigError, RelaySettings};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{DispatchError, RelayError, SubscribeError};
use crate::keyspace::Keyspace;
use crate::reconciler::{NoticeTemplates, ReconcileReport, Reconciler, SubscriptionUpdate};
use crate::resolver::ResolverRegistry;
use crate::stats::StatsAggregator;
use crate::storage::{InMemoryKvStore, KvStore};
use crate::subscription::SubscriptionStore;
use crate::types::{ChannelType, Message, RecipientId, Stats};
use crate::worker::{DeadLetter, SendPool, SendPoolConfig};

/// Everything a subscribe page needs to render for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionView {
    pub recipient: RecipientId,
    pub subscribed: bool,
    pub channels: Vec<ChannelView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelView {
    #[serde(rename = "type")]
    pub channel: ChannelType,
    /// Format hint derived from the channel's validation rule.
    pub rule: String,
    pub address: Option<String>,
}

/// Wiring of store, registries, dispatcher, reconciler and send pool.
///
/// Methods map one-to-one onto the relay's external interfaces; an HTTP
/// layer only has to extract credentials and bodies and turn
/// [`RelayError::status_code`] into a response.
pub struct Relay {
    api_users: ApiUsers,
    channels: Arc<ChannelRegistry>,
    subscriptions: SubscriptionStore,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    stats: StatsAggregator,
    pool: SendPool,
}

pub struct RelayBuilder {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    resolvers: ResolverRegistry,
    channels: ChannelRegistry,
    notices: NoticeTemplates,
    api_users: ApiUsers,
    pool: SendPoolConfig,
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self {
            store: Arc::new(InMemoryKvStore::new()),
            keys: Keyspace::default(),
            resolvers: ResolverRegistry::new(),
            channels: ChannelRegistry::new(),
            notices: NoticeTemplates::default(),
            api_users: ApiUsers::default(),
            pool: SendPoolConfig::default(),
        }
    }
}

impl RelayBuilder {
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = store;
        self
    }

    pub fn keyspace(mut self, keys: Keyspace) -> Self {
        self.keys = keys;
        self
    }

    pub fn resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn channels(mut self, channels: ChannelRegistry) -> Self {
        self.channels = channels;
        self
    }

    pub fn notices(mut self, notices: NoticeTemplates) -> Self {
        self.notices = notices;
        self
    }

    pub fn api_users(mut self, api_users: ApiUsers) -> Self {
        self.api_users = api_users;
        self
    }

    pub fn send_pool(mut self, pool: SendPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Start the send pool and assemble the relay. Needs a tokio runtime.
    pub fn build(self) -> Relay {
        let pool = SendPool::start(self.pool);
        let channels = Arc::new(self.channels);
        let resolvers = Arc::new(self.resolvers);
        let subscriptions = SubscriptionStore::new(self.store.clone(), self.keys.clone());

        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.keys.clone(),
            resolvers,
            channels.clone(),
            pool.queue(),
        );
        let reconciler = Reconciler::new(subscriptions.clone(), channels.clone(), pool.queue(), self.notices);
        let stats = StatsAggregator::new(self.store, self.keys);

        if self.api_users.is_empty() {
            tracing::warn!("no API users configured, submissions will be refused");
        }

        Relay {
            api_users: self.api_users,
            channels,
            subscriptions,
            dispatcher,
            reconciler,
            stats,
            pool,
        }
    }
}

impl Relay {
    pub fn builder() -> RelayBuilder {
        RelayBuilder::default()
    }

    /// Build a relay from loaded settings.
    pub fn from_settings(settings: &RelaySettings) -> Result<Self, ConfigError> {
        let keys = settings.keyspace()?;
        let store = open_store(settings)?;
        let channels = settings.channel_registry()?;

        tracing::info!(
            channels = ?channels.channel_types(),
            target_types = settings.resolvers.len(),
            "relay configured"
        );

        Ok(Self::builder()
            .store(store)
            .keyspace(keys)
            .resolvers(settings.resolver_registry())
            .channels(channels)
            .notices(settings.notices.clone())
            .api_users(ApiUsers::new(&settings.api_users))
            .send_pool(settings.dispatcher.pool_config())
            .build())
    }

    /// Inbound message submission.
    pub async fn submit(
        &self,
        credentials: Option<&Credentials>,
        payload: &[u8],
    ) -> Result<DispatchOutcome, RelayError> {
        if !self.api_users.authorize(credentials) {
            return Err(RelayError::Unauthorized);
        }
        let message = Message::from_json(payload).map_err(DispatchError::from)?;
        Ok(self.dispatcher.dispatch(&message).await?)
    }

    /// Dispatch an already decoded message, bypassing API authentication.
    pub async fn dispatch(&self, message: &Message) -> Result<DispatchOutcome, DispatchError> {
        self.dispatcher.dispatch(message).await
    }

    /// Inbound subscription update for `recipient`, on behalf of `session`.
    pub async fn subscribe(
        &self,
        session: Option<&SessionIdentity>,
        recipient: &str,
        update: SubscriptionUpdate,
    ) -> Result<ReconcileReport, RelayError> {
        // Authorization first: a caller without a matching session learns nothing about the id.
        if !session.is_some_and(|s| s.0.as_str() == recipient) {
            return Err(RelayError::Unauthorized);
        }
        let recipient = RecipientId::parse(recipient).map_err(SubscribeError::from)?;
        Ok(self.reconciler.reconcile(&recipient, update).await?)
    }

    /// Parse `address-<channel>` form fields against the registered channels.
    pub fn parse_form<'a, I>(&self, fields: I) -> Result<SubscriptionUpdate, RelayError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Ok(SubscriptionUpdate::from_form(fields, &self.channels)?)
    }

    /// Current subscription of `recipient` alongside every channel's rule.
    pub async fn subscription_view(&self, recipient: &RecipientId) -> Result<SubscriptionView, RelayError> {
        let current = match self.subscriptions.load(recipient).await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(crate::error::StoreError::Serde(_)) => Default::default(),
            Err(err) => return Err(err.into()),
        };

        let channels = self
            .channels
            .iter()
            .map(|(channel, sender)| ChannelView {
                channel: channel.clone(),
                rule: sender.validation_rule().to_string(),
                address: current.address(channel).map(str::to_string),
            })
            .collect();

        Ok(SubscriptionView {
            recipient: recipient.clone(),
            subscribed: !current.is_empty(),
            channels,
        })
    }

    /// Stats query.
    pub async fn stats(&self) -> Result<Stats, RelayError> {
        Ok(self.stats.snapshot().await?)
    }

    /// Subscriber enumeration; privileged.
    pub async fn subscribers(&self, credentials: Option<&Credentials>) -> Result<Vec<RecipientId>, RelayError> {
        if !self.api_users.authorize(credentials) {
            return Err(RelayError::Unauthorized);
        }
        Ok(self.subscriptions.recipients().await?)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.pool.dead_letters().snapshot().await
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Stop intake and wait for queued sends to finish.
    pub async fn shutdown(&mut self) {
        self.pool.shutdown().await;
        tracing::info!("relay shut down");
    }
}

#[cfg(feature = "redis")]
fn open_store(settings: &RelaySettings) -> Result<Arc<dyn KvStore>, ConfigError> {
    match &settings.store.redis_url {
        Some(url) => Ok(Arc::new(crate::storage_redis::RedisKvStore::open(url)?)),
        None => Ok(Arc::new(InMemoryKvStore::new())),
    }
}

#[cfg(not(feature = "redis"))]
fn open_store(settings: &RelaySettings) -> Result<Arc<dyn KvStore>, ConfigError> {
    if settings.store.redis_url.is_some() {
        tracing::warn!("redis_url set but built without the redis feature, using in-memory store");
    }
    Ok(Arc::new(InMemoryKvStore::new()))
}
