//! Channel senders and their registry.
//!
//! A channel is a delivery transport (mail, message queue, webhook, ...)
//! identified by a tag. Each sender owns its address format; the relay only
//! asks it to validate addresses and to send.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::error::SendError;
use crate::types::ChannelType;

/// Addresses of the form `local@domain.tld`.
pub const EMAIL_PATTERN: &str =
    r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9-]+(?:\.[a-zA-Z0-9-]+)*$";

/// International phone numbers in E.164 form, e.g. `+15550100`.
pub const E164_PATTERN: &str = r"^\+[1-9][0-9]{6,14}$";

#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Hand a notification to the transport.
    ///
    /// `Ok` means the transport accepted it, not that it was received.
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<(), SendError>;

    /// Whether `address` conforms to this channel's format.
    fn validate(&self, address: &str) -> bool;

    /// Human readable form of the validation rule, shown to subscribers.
    fn validation_rule(&self) -> &str;
}

/// Regex-backed address format.
#[derive(Debug, Clone)]
pub struct AddressRule {
    regex: Regex,
}

impl AddressRule {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    pub fn email() -> Self {
        Self::builtin(EMAIL_PATTERN)
    }

    pub fn e164() -> Self {
        Self::builtin(E164_PATTERN)
    }

    fn builtin(pattern: &str) -> Self {
        #[allow(clippy::expect_used)]
        let regex = Regex::new(pattern).expect("built-in address pattern compiles");
        Self { regex }
    }

    pub fn matches(&self, address: &str) -> bool {
        self.regex.is_match(address)
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

/// Channel whose transport is the log.
///
/// Useful as a dry-run channel and in environments without a mail relay.
pub struct LogSender {
    channel: ChannelType,
    rule: AddressRule,
}

impl LogSender {
    pub fn new(channel: impl Into<ChannelType>, rule: AddressRule) -> Self {
        Self {
            channel: channel.into(),
            rule,
        }
    }
}

#[async_trait]
impl ChannelSender for LogSender {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<(), SendError> {
        if address.is_empty() {
            return Err(SendError::EmptyAddress);
        }
        tracing::info!(channel = %self.channel, address, subject, body, "notification");
        Ok(())
    }

    fn validate(&self, address: &str) -> bool {
        self.rule.matches(address)
    }

    fn validation_rule(&self) -> &str {
        self.rule.pattern()
    }
}

/// Registry of channel senders keyed by channel type.
///
/// Populated at startup; the dispatcher never needs to change when a new
/// channel is added.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    senders: BTreeMap<ChannelType, Arc<dyn ChannelSender>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: impl Into<ChannelType>, sender: Arc<dyn ChannelSender>) {
        let channel = channel.into();
        tracing::debug!(%channel, "channel sender registered");
        self.senders.insert(channel, sender);
    }

    pub fn with(mut self, channel: impl Into<ChannelType>, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(channel, sender);
        self
    }

    pub fn get(&self, channel: &ChannelType) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(channel)
    }

    pub fn contains(&self, channel: &ChannelType) -> bool {
        self.senders.contains_key(channel)
    }

    /// Registered channel types, sorted.
    pub fn channel_types(&self) -> Vec<ChannelType> {
        self.senders.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChannelType, &Arc<dyn ChannelSender>)> {
        self.senders.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules() {
        let email = AddressRule::email();
        assert!(email.matches("a@x.com"));
        assert!(!email.matches("not-an-address"));

        let phone = AddressRule::e164();
        assert!(phone.matches("+15550100"));
        assert!(!phone.matches("5550100"));
    }

    #[tokio::test]
    async fn log_sender_rejects_empty_address() {
        let sender = LogSender::new("email", AddressRule::email());
        assert!(matches!(sender.send("", "s", "b").await, Err(SendError::EmptyAddress)));
        assert!(sender.send("a@x.com", "s", "b").await.is_ok());
        assert_eq!(sender.validation_rule(), EMAIL_PATTERN);
    }

    #[test]
    fn registry_lists_sorted_channel_types() {
        let registry = ChannelRegistry::new()
            .with("sms", Arc::new(LogSender::new("sms", AddressRule::e164())))
            .with("email", Arc::new(LogSender::new("email", AddressRule::email())));

        assert_eq!(
            registry.channel_types(),
            vec![ChannelType::new("email"), ChannelType::new("sms")]
        );
        assert!(registry.contains(&"sms".into()));
        assert!(registry.get(&"fax".into()).is_none());
    }
}
