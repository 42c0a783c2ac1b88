//! Subscription updates.
//!
//! An update replaces a recipient's whole channel -> address mapping. The
//! difference with the stored mapping decides which addresses get a welcome
//! notice and which get a goodbye notice.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::channel::ChannelRegistry;
use crate::error::{AddressViolation, StoreError, SubscribeError};
use crate::subscription::SubscriptionStore;
use crate::types::{ChannelType, RecipientId, Subscription};
use crate::worker::{EnqueueError, SendJob, SendKind, SendQueue};

/// Prefix of the form fields carrying addresses, e.g. `address-email`.
pub const ADDRESS_FIELD_PREFIX: &str = "address-";

/// Texts of the welcome and goodbye notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoticeTemplates {
    pub welcome_subject: String,
    pub welcome_body: String,
    pub goodbye_subject: String,
    pub goodbye_body: String,
}

impl Default for NoticeTemplates {
    fn default() -> Self {
        Self {
            welcome_subject: "Subscribed to notifications".to_string(),
            welcome_body: "This address will now receive notifications.".to_string(),
            goodbye_subject: "Unsubscribed from notifications".to_string(),
            goodbye_body: "This address will no longer receive notifications.".to_string(),
        }
    }
}

/// Proposed channel -> address mapping for one recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    addresses: BTreeMap<ChannelType, String>,
}

impl SubscriptionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, channel: impl Into<ChannelType>, address: impl Into<String>) -> Self {
        self.addresses.insert(channel.into(), address.into());
        self
    }

    /// Parse `address-<channel>` form fields; other fields are ignored.
    pub fn from_form<'a, I>(fields: I, channels: &ChannelRegistry) -> Result<Self, SubscribeError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut update = Self::new();
        for (name, value) in fields {
            let Some(tag) = name.strip_prefix(ADDRESS_FIELD_PREFIX) else {
                continue;
            };
            let channel = ChannelType::new(tag);
            if !channels.contains(&channel) {
                return Err(SubscribeError::UnknownChannel { channel });
            }
            update.addresses.insert(channel, value.trim().to_string());
        }
        Ok(update)
    }

    pub fn addresses(&self) -> impl Iterator<Item = (&ChannelType, &str)> {
        self.addresses.iter().map(|(c, a)| (c, a.as_str()))
    }

    /// Resulting subscription, without empty addresses.
    pub fn into_subscription(self) -> Subscription {
        Subscription {
            addresses: self.addresses.into_iter().filter(|(_, a)| !a.is_empty()).collect(),
        }
    }
}

/// Addresses to greet and to say goodbye to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub welcome: Vec<(ChannelType, String)>,
    pub goodbye: Vec<(ChannelType, String)>,
}

/// Compare two mappings channel by channel.
///
/// A new or changed address is welcomed; a removed or replaced address gets
/// a goodbye. Unchanged channels produce neither.
pub fn diff(old: &Subscription, new: &Subscription) -> SubscriptionDiff {
    let welcome = new
        .active()
        .filter(|(channel, address)| old.address(channel) != Some(*address))
        .map(|(c, a)| (c.clone(), a.to_string()))
        .collect();

    let goodbye = old
        .active()
        .filter(|(channel, address)| new.address(channel) != Some(*address))
        .map(|(c, a)| (c.clone(), a.to_string()))
        .collect();

    SubscriptionDiff { welcome, goodbye }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub welcomed: Vec<(ChannelType, String)>,
    pub farewelled: Vec<(ChannelType, String)>,
    /// The record was removed because the new mapping was empty.
    pub deleted: bool,
    /// Notices refused by the send queue.
    pub dropped: usize,
}

/// Applies subscription updates.
///
/// Updates for the same recipient are serialized in-process; the stored
/// record is read, diffed and written under that lock.
#[derive(Clone)]
pub struct Reconciler {
    subscriptions: SubscriptionStore,
    channels: Arc<ChannelRegistry>,
    queue: SendQueue,
    notices: Arc<NoticeTemplates>,
    locks: Arc<Mutex<HashMap<RecipientId, Arc<Mutex<()>>>>>,
}

impl Reconciler {
    pub fn new(
        subscriptions: SubscriptionStore,
        channels: Arc<ChannelRegistry>,
        queue: SendQueue,
        notices: NoticeTemplates,
    ) -> Self {
        Self {
            subscriptions,
            channels,
            queue,
            notices: Arc::new(notices),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check every proposed address; any violation rejects the whole update.
    pub fn validate(&self, update: &SubscriptionUpdate) -> Result<(), SubscribeError> {
        let mut violations = Vec::new();
        for (channel, address) in update.addresses() {
            let Some(sender) = self.channels.get(channel) else {
                return Err(SubscribeError::UnknownChannel {
                    channel: channel.clone(),
                });
            };
            if !address.is_empty() && !sender.validate(address) {
                violations.push(AddressViolation {
                    channel: channel.clone(),
                    address: address.to_string(),
                    rule: sender.validation_rule().to_string(),
                });
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SubscribeError::InvalidAddresses(violations))
        }
    }

    pub async fn reconcile(
        &self,
        recipient: &RecipientId,
        update: SubscriptionUpdate,
    ) -> Result<ReconcileReport, SubscribeError> {
        self.validate(&update)?;

        let lock = self.lock_for(recipient).await;
        let guard = lock.lock().await;
        let result = self.apply(recipient, update).await;
        drop(guard);
        self.release(recipient, lock).await;

        let (diff, deleted) = result?;
        let mut report = ReconcileReport {
            deleted,
            ..Default::default()
        };

        for (channel, address) in diff.goodbye {
            if self.notify(SendKind::Goodbye, &channel, &address).await {
                report.farewelled.push((channel, address));
            } else {
                report.dropped += 1;
            }
        }
        for (channel, address) in diff.welcome {
            if self.notify(SendKind::Welcome, &channel, &address).await {
                report.welcomed.push((channel, address));
            } else {
                report.dropped += 1;
            }
        }

        tracing::info!(
            %recipient,
            welcomed = report.welcomed.len(),
            farewelled = report.farewelled.len(),
            deleted = report.deleted,
            "subscription updated"
        );
        Ok(report)
    }

    async fn apply(
        &self,
        recipient: &RecipientId,
        update: SubscriptionUpdate,
    ) -> Result<(SubscriptionDiff, bool), SubscribeError> {
        let old = match self.subscriptions.load(recipient).await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(StoreError::Serde(err)) => {
                tracing::warn!(%recipient, error = %err, "unreadable subscription, treating as empty");
                Subscription::default()
            }
            Err(err) => return Err(err.into()),
        };

        let new = update.into_subscription();
        let changes = diff(&old, &new);

        let deleted = if new.is_empty() {
            self.subscriptions.delete(recipient).await?;
            true
        } else {
            self.subscriptions.save(recipient, &new).await?;
            false
        };

        Ok((changes, deleted))
    }

    /// Queue a welcome or goodbye notice. Not counted in the sent counters.
    async fn notify(&self, kind: SendKind, channel: &ChannelType, address: &str) -> bool {
        let Some(sender) = self.channels.get(channel) else {
            tracing::warn!(%channel, address, %kind, "no sender for channel, notice skipped");
            return false;
        };

        let (subject, body) = match kind {
            SendKind::Goodbye => (&self.notices.goodbye_subject, &self.notices.goodbye_body),
            _ => (&self.notices.welcome_subject, &self.notices.welcome_body),
        };

        let job = SendJob {
            kind,
            message_id: None,
            channel: channel.clone(),
            address: address.to_string(),
            subject: Arc::from(subject.as_str()),
            body: Arc::from(body.as_str()),
            sender: sender.clone(),
        };

        match self.queue.enqueue(job).await {
            Ok(()) => true,
            Err(EnqueueError::Backpressure) | Err(EnqueueError::Shutdown) => false,
        }
    }

    async fn lock_for(&self, recipient: &RecipientId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // Entries left by cancelled waiters are held by the map alone.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(recipient.clone()).or_default().clone()
    }

    async fn release(&self, recipient: &RecipientId, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // Only the map and this call hold it: nobody is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(recipient);
        }
    }
}
