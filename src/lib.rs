//! A notification relay.
//!
//! Client systems submit messages addressed to a *target* (a typed group of
//! recipients). The relay resolves the target to recipients, looks up each
//! recipient's channel subscriptions and fans the message out to one send
//! per active channel address. Recipients manage their own subscriptions
//! and receive welcome/goodbye notices when channels are added or removed.
//!
//! ## Guarantees
//! - Message ids are deduplicated for the lifetime of their TTL
//! - Bounded send queue with explicit backpressure
//! - Subscription updates are serialized per recipient
//! - Invalid addresses reject the whole update
//!
//! ## Non-Guarantees
//! - Delivery confirmation or retries
//! - Durability of queued sends across restarts
//! - Exactly-once delivery when the dedup write fails
//! - HTTP routing, sessions or OAuth
//!
//! The embedding service owns the transport; [`Relay`] exposes one method
//! per external interface and [`RelayError::status_code`] for the response.

mod auth;
mod channel;
mod config;
mod dispatcher;
mod error;
mod keyspace;
mod reconciler;
mod relay;
mod resolver;
mod signing;
mod stats;
mod storage;
mod subscription;
mod types;
mod worker;

pub mod logging;

#[cfg(feature = "http")]
mod channel_webhook;

#[cfg(feature = "redis")]
mod storage_redis;

pub use auth::{ApiUsers, Credentials, SessionIdentity};
pub use channel::{
    AddressRule, ChannelRegistry, ChannelSender, LogSender, E164_PATTERN, EMAIL_PATTERN,
};
pub use crate::config::{
    load_settings, ChannelSettings, ConfigError, DispatcherSettings, RelaySettings,
    ResolverSettings, SenderKind, StoreSettings, DEFAULT_CONFIG_FILE,
};
pub use dispatcher::{DispatchOutcome, DispatchReport, Dispatcher, Persistence};
pub use error::{
    AddressViolation, DispatchError, DropReason, MessageError, RelayError, ResolveError,
    SendError, SendOutcome, StoreError, SubscribeError,
};
pub use keyspace::{
    Keyspace, ReservedPrefix, COUNTERS_KEY, DEFAULT_SUBSCRIPTION_PREFIX, MESSAGE_PREFIX,
};
pub use reconciler::{
    diff, NoticeTemplates, ReconcileReport, Reconciler, SubscriptionDiff, SubscriptionUpdate,
    ADDRESS_FIELD_PREFIX,
};
pub use relay::{ChannelView, Relay, RelayBuilder, SubscriptionView};
pub use resolver::{RecipientResolver, ResolverRegistry, StaticResolver, DEFAULT_SCOPE};
pub use signing::{
    build_signature_headers, compute_signature, is_timestamp_fresh, verify_notification_request,
    verify_signature, SignatureHeaders, VerificationError, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
pub use stats::StatsAggregator;
pub use storage::{InMemoryKvStore, KvStore};
pub use subscription::SubscriptionStore;
pub use types::{
    parse_ttl, ChannelType, InvalidRecipient, Message, MessageId, MessageTarget, RecipientId,
    Stats, Subscription,
};
pub use worker::{
    DeadLetter, DeadLetters, EnqueueError, OverflowPolicy, SendJob, SendKind, SendPool,
    SendPoolConfig, SendQueue,
};

#[cfg(feature = "http")]
pub use channel_webhook::WebhookSender;

#[cfg(feature = "redis")]
pub use storage_redis::RedisKvStore;
