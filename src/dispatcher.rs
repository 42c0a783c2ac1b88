use std::collections::BTreeMap;
use std::sync::Arc;

use crate::channel::ChannelRegistry;
use crate::error::{DispatchError, MessageError};
use crate::keyspace::{Keyspace, COUNTERS_KEY};
use crate::resolver::ResolverRegistry;
use crate::storage::KvStore;
use crate::subscription::SubscriptionStore;
use crate::types::{Message, MessageId, RecipientId, Subscription};
use crate::worker::{EnqueueError, SendJob, SendKind, SendQueue};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// What happened to the deduplication ledger entry of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// TTL was zero; nothing written.
    Skipped,
    Stored,
    /// The write failed; the message was still dispatched.
    Failed,
}

/// Summary of an accepted dispatch.
///
/// Counts describe sends *queued*, not sends delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub message_id: MessageId,
    pub target_type: String,
    pub persistence: Persistence,
    /// Recipient ids returned by the resolver.
    pub recipients_resolved: usize,
    /// Recipients with a stored subscription.
    pub recipients_found: usize,
    pub queued: usize,
    /// Sends refused by a full or closed queue.
    pub dropped: usize,
    /// Addresses whose channel type has no registered sender.
    pub skipped: usize,
}

impl DispatchReport {
    pub fn has_recipients(&self) -> bool {
        self.recipients_found > 0
    }

    /// Caller should back off before submitting more work.
    pub fn is_backpressured(&self) -> bool {
        self.dropped > 0
    }

    /// Free-text acknowledgement returned to the submitter.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if self.persistence == Persistence::Failed {
            lines.push("message accepted but unable to store".to_string());
        }
        if !self.has_recipients() {
            lines.push(format!(
                "No recipients found for {} with id {}",
                self.target_type, self.message_id
            ));
        } else {
            lines.push(format!("message sent ({} queued)", self.queued));
        }
        if self.dropped > 0 {
            lines.push(format!("{} send(s) dropped: relay at capacity or shutting down", self.dropped));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A ledger entry for this id exists; nothing was sent.
    Duplicate { message_id: MessageId },
    Dispatched(DispatchReport),
}

/// Intake and fan-out of messages.
///
/// Dispatch returns once every send has been queued. Dropping the returned
/// future cancels resolution and lookups; sends already queued still run.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    subscriptions: SubscriptionStore,
    resolvers: Arc<ResolverRegistry>,
    channels: Arc<ChannelRegistry>,
    queue: SendQueue,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        resolvers: Arc<ResolverRegistry>,
        channels: Arc<ChannelRegistry>,
        queue: SendQueue,
    ) -> Self {
        let subscriptions = SubscriptionStore::new(store.clone(), keys.clone());
        Self {
            store,
            keys,
            subscriptions,
            resolvers,
            channels,
            queue,
        }
    }

    pub async fn dispatch(&self, message: &Message) -> Result<DispatchOutcome, DispatchError> {
        if message.id.0.is_empty() {
            return Err(MessageError::MissingId.into());
        }

        // Checked before touching the ledger so an unknown target has no side effects.
        let resolver = self.resolvers.get(&message.target.kind).cloned().ok_or_else(|| {
            metric_inc("relay.dispatch.not_implemented");
            DispatchError::NotImplemented {
                target_type: message.target.kind.clone(),
            }
        })?;

        // Read-then-write: concurrent duplicates may both get through.
        let key = self.keys.message_key(&message.id);
        match self.store.get(&key).await {
            Ok(Some(_)) => {
                metric_inc("relay.dispatch.duplicate");
                tracing::info!(message_id = %message.id, "existing message, not sending again");
                return Ok(DispatchOutcome::Duplicate {
                    message_id: message.id.clone(),
                });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(message_id = %message.id, error = %err, "dedup lookup failed, dispatching anyway");
            }
        }

        let persistence = self.persist(&key, message).await;

        let recipients = match resolver.resolve(&message.target.scope, &message.target.group).await {
            Ok(recipients) => recipients,
            Err(err) => {
                tracing::warn!(
                    message_id = %message.id,
                    target_type = %message.target.kind,
                    group = %message.target.group,
                    error = %err,
                    "recipient resolution failed"
                );
                if persistence == Persistence::Stored {
                    self.roll_back(&key).await;
                }
                return Err(DispatchError::Resolution(err));
            }
        };

        let subscriptions = self.collect_subscriptions(&recipients).await;
        if subscriptions.is_empty() {
            tracing::info!(
                message_id = %message.id,
                target_type = %message.target.kind,
                group = %message.target.group,
                "message sent to target without recipients"
            );
        }

        let mut report = DispatchReport {
            message_id: message.id.clone(),
            target_type: message.target.kind.clone(),
            persistence,
            recipients_resolved: recipients.len(),
            recipients_found: subscriptions.len(),
            queued: 0,
            dropped: 0,
            skipped: 0,
        };

        if let Err(err) = self.fan_out(message, &subscriptions, &mut report).await {
            // Nothing was queued: leave no ledger entry behind.
            if report.queued == 0 {
                if persistence == Persistence::Stored {
                    self.roll_back(&key).await;
                }
                return Err(err);
            }
            tracing::warn!(
                message_id = %message.id,
                queued = report.queued,
                error = %err,
                "send pool closed during fan-out, returning partial report"
            );
        }

        metric_inc("relay.dispatch.accepted");
        tracing::info!(
            message_id = %message.id,
            recipients = report.recipients_found,
            queued = report.queued,
            dropped = report.dropped,
            "message dispatched"
        );
        Ok(DispatchOutcome::Dispatched(report))
    }

    async fn persist(&self, key: &str, message: &Message) -> Persistence {
        if message.ttl.is_zero() {
            return Persistence::Skipped;
        }

        let raw = match serde_json::to_string(message) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(message_id = %message.id, error = %err, "unable to encode message");
                return Persistence::Failed;
            }
        };

        match self.store.set(key, &raw, Some(message.ttl)).await {
            Ok(()) => Persistence::Stored,
            Err(err) => {
                metric_inc("relay.dispatch.store_failed");
                tracing::warn!(message_id = %message.id, error = %err, "message accepted but unable to store");
                Persistence::Failed
            }
        }
    }

    async fn roll_back(&self, key: &str) {
        if let Err(err) = self.store.delete(key).await {
            tracing::warn!(key, error = %err, "unable to roll back dedup entry");
        }
    }

    /// Best effort: missing or undecodable subscriptions are skipped.
    async fn collect_subscriptions(&self, recipients: &[String]) -> BTreeMap<RecipientId, Subscription> {
        let mut found = BTreeMap::new();
        for raw in recipients {
            let recipient = match RecipientId::parse(raw.as_str()) {
                Ok(recipient) => recipient,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping recipient");
                    continue;
                }
            };
            if found.contains_key(&recipient) {
                continue;
            }

            match self.subscriptions.load(&recipient).await {
                Ok(Some(subscription)) => {
                    found.insert(recipient, subscription);
                }
                Ok(None) => {
                    tracing::debug!(%recipient, "no contact info found");
                }
                Err(err) => {
                    tracing::warn!(%recipient, error = %err, "unreadable subscription, skipping");
                }
            }
        }
        found
    }

    async fn fan_out(
        &self,
        message: &Message,
        subscriptions: &BTreeMap<RecipientId, Subscription>,
        report: &mut DispatchReport,
    ) -> Result<(), DispatchError> {
        let subject: Arc<str> = Arc::from(message.subject.as_str());
        let body: Arc<str> = Arc::from(message.body.as_str());

        for (recipient, subscription) in subscriptions {
            for (channel, address) in subscription.active() {
                let Some(sender) = self.channels.get(channel) else {
                    tracing::warn!(%recipient, %channel, "address type not valid, skipping");
                    report.skipped += 1;
                    continue;
                };

                let job = SendJob {
                    kind: SendKind::Notification,
                    message_id: Some(message.id.clone()),
                    channel: channel.clone(),
                    address: address.to_string(),
                    subject: subject.clone(),
                    body: body.clone(),
                    sender: sender.clone(),
                };

                match self.queue.enqueue(job).await {
                    Ok(()) => {
                        report.queued += 1;
                        // Counts sends attempted, not sends confirmed.
                        if let Err(err) = self.store.incr_field(COUNTERS_KEY, channel.as_str(), 1).await {
                            tracing::warn!(%channel, error = %err, "unable to increment sent counter");
                        }
                    }
                    Err(EnqueueError::Backpressure) => report.dropped += 1,
                    Err(EnqueueError::Shutdown) => {
                        report.dropped += 1;
                        return Err(DispatchError::Shutdown);
                    }
                }
            }
        }
        Ok(())
    }
}
