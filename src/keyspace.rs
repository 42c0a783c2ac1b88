//! Layout of the relay's records inside the key-value store.
//!
//! ```text
//! msg-<id>          serialized Message, expires with the message TTL
//! <prefix><user>    serialized Subscription, no expiry
//! counters          hash of channel type -> sends dispatched
//! ```

use crate::types::{MessageId, RecipientId};

/// Namespace of deduplication ledger entries.
pub const MESSAGE_PREFIX: &str = "msg-";

/// Hash holding one sent-counter field per channel type.
pub const COUNTERS_KEY: &str = "counters";

/// Default namespace of subscription records.
pub const DEFAULT_SUBSCRIPTION_PREFIX: &str = "sub-";

/// A subscription prefix whose namespace would overlap a reserved key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("subscription prefix {prefix:?} overlaps reserved key {reserved:?}")]
pub struct ReservedPrefix {
    pub prefix: String,
    pub reserved: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    subscription_prefix: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self {
            subscription_prefix: DEFAULT_SUBSCRIPTION_PREFIX.to_string(),
        }
    }
}

impl Keyspace {
    /// An empty prefix selects the legacy layout where subscriptions are
    /// stored under the bare recipient id.
    ///
    /// A non-empty prefix must not cover `counters` or any `msg-` key, so
    /// that a prefix scan only ever sees subscription records.
    pub fn new(subscription_prefix: impl Into<String>) -> Result<Self, ReservedPrefix> {
        let prefix = subscription_prefix.into();
        if !prefix.is_empty() {
            let covered = [COUNTERS_KEY, MESSAGE_PREFIX]
                .into_iter()
                .find(|reserved| reserved.starts_with(prefix.as_str()));
            let nested = prefix.starts_with(MESSAGE_PREFIX).then_some(MESSAGE_PREFIX);
            if let Some(reserved) = covered.or(nested) {
                return Err(ReservedPrefix { prefix, reserved });
            }
        }
        Ok(Self {
            subscription_prefix: prefix,
        })
    }

    /// Legacy layout with subscriptions under bare recipient ids.
    pub fn legacy() -> Self {
        Self {
            subscription_prefix: String::new(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.subscription_prefix.is_empty()
    }

    pub fn subscription_prefix(&self) -> &str {
        &self.subscription_prefix
    }

    pub fn message_key(&self, id: &MessageId) -> String {
        format!("{MESSAGE_PREFIX}{}", id.0)
    }

    pub fn subscription_key(&self, recipient: &RecipientId) -> String {
        format!("{}{}", self.subscription_prefix, recipient.as_str())
    }

    /// Map a store key back to the recipient owning it, if the key is a
    /// subscription record.
    pub fn recipient_for_key(&self, key: &str) -> Option<RecipientId> {
        if key == COUNTERS_KEY || key.starts_with(MESSAGE_PREFIX) {
            return None;
        }
        let id = key.strip_prefix(self.subscription_prefix.as_str())?;
        RecipientId::parse(id).ok()
    }
}
